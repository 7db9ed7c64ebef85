//! `SessionDraft`: snapshot persistido de una sesión en curso.
//!
//! Ciclo de vida: se crea en el primer guardado, se actualiza en cada
//! autosave y se elimina al aceptar una recuperación o al descartarlo.
//! `version` la asigna el store (estrictamente creciente por escritura) y
//! `checksum` (sha256 del JSON de `data`) permite detectar borradores
//! corruptos al cargarlos.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{DomainError, GuidedFlowData, SessionContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SaveReason {
    #[serde(rename = "auto-save")]
    AutoSave,
    #[serde(rename = "manual-save")]
    ManualSave,
}

impl SaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveReason::AutoSave => "auto-save",
            SaveReason::ManualSave => "manual-save",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto-save" => Some(SaveReason::AutoSave),
            "manual-save" => Some(SaveReason::ManualSave),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDraft {
    pub id: Uuid,
    pub principal_id: String,
    pub estimate_id: String,
    pub data: GuidedFlowData,
    pub current_step: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub save_reason: SaveReason,
    pub version: u64,
    pub checksum: String,
}

impl SessionDraft {
    /// Nuevo borrador sin persistir (`version = 0`; el store asigna la real).
    pub fn new(id: Uuid,
               session: &SessionContext,
               data: GuidedFlowData,
               current_step: usize,
               save_reason: SaveReason,
               now: DateTime<Utc>)
               -> Self {
        let checksum = Self::compute_checksum(&data);
        Self { id,
               principal_id: session.principal_id.clone(),
               estimate_id: session.estimate_id.clone(),
               data,
               current_step,
               created_at: now,
               updated_at: now,
               save_reason,
               version: 0,
               checksum }
    }

    /// sha256 (hex) de la serialización de `data`. La serialización es
    /// estable porque `GuidedFlowData` y `serde_json::Map` ordenan claves.
    pub fn compute_checksum(data: &GuidedFlowData) -> String {
        let bytes = serde_json::to_vec(data).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }

    pub fn verify_checksum(&self) -> Result<(), DomainError> {
        let found = Self::compute_checksum(&self.data);
        if found == self.checksum {
            Ok(())
        } else {
            Err(DomainError::ChecksumMismatch { expected: self.checksum.clone(),
                                                found })
        }
    }

    pub fn summary(&self) -> DraftSummary {
        DraftSummary { id: self.id,
                       principal_id: self.principal_id.clone(),
                       estimate_id: self.estimate_id.clone(),
                       current_step: self.current_step,
                       updated_at: self.updated_at,
                       save_reason: self.save_reason,
                       version: self.version }
    }
}

/// Metadatos de listado (sin payload), usados para ofrecer recuperación.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSummary {
    pub id: Uuid,
    pub principal_id: String,
    pub estimate_id: String,
    pub current_step: usize,
    pub updated_at: DateTime<Utc>,
    pub save_reason: SaveReason,
    pub version: u64,
}
