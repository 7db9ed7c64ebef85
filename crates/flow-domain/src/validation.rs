//! Resultado de la validación cruzada entre steps.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Confidence, StepId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    pub step_id: StepId,
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

/// Aviso no bloqueante: un cambio puede invalidar steps posteriores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationWarning {
    pub message: String,
    pub affected_steps: Vec<StepId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
    pub suggestions: Vec<String>,
    pub blocked_steps: Vec<StepId>,
    pub confidence: Confidence,
    pub last_validated: DateTime<Utc>,
}

impl ValidationResult {
    /// `true` si ningún error tiene severidad `Error`.
    pub fn is_valid(&self) -> bool {
        self.errors.iter().all(|e| e.severity != Severity::Error)
    }

    pub fn is_blocked(&self, step_id: &str) -> bool {
        self.blocked_steps.iter().any(|s| s == step_id)
    }
}
