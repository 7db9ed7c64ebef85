//! Snapshots de precio y contrato de datos del oráculo de precios.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::StepId;

/// Medidas fusionadas de los steps de medición (`glassArea`, `stories`, ...).
pub type Measurements = Map<String, Value>;

/// Etiqueta cualitativa de fiabilidad de un resultado derivado. El orden
/// (`Low < Medium < High`) permite degradar con `min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Servicio elegido por el usuario, con opciones libres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSelection {
    pub service_id: String,
    #[serde(default)]
    pub options: Value,
}

impl ServiceSelection {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self { service_id: service_id.into(),
               options: Value::Null }
    }
}

/// Respuesta del oráculo para un servicio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCost {
    pub cost: f64,
    #[serde(default)]
    pub required_fields_missing: Vec<String>,
}

/// Línea del desglose por servicio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceLineItem {
    pub service_id: String,
    pub cost: f64,
    pub missing_fields: Vec<String>,
}

/// Snapshot inmutable de precio; se reemplaza por el siguiente cálculo de la
/// misma estimación.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingResult {
    pub total_cost: f64,
    pub service_breakdown: Vec<ServiceLineItem>,
    pub confidence: Confidence,
    pub missing_data: Vec<String>,
    pub computed_at: DateTime<Utc>,
    pub source_steps_used: Vec<StepId>,
}
