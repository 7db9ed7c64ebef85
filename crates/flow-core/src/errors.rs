//! Errores del motor de coordinación.
//!
//! `FlowError` es `Clone` porque un mismo resultado (p. ej. el de un guardado
//! single-flight) se entrega a varios llamadores.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum FlowError {
    /// Regla de transición o referencial violada. Siempre se expone.
    #[error("validation rejected: {0}")]
    ValidationRejected(String),
    /// El oráculo falló o no respondió a tiempo; el resultado previo sigue
    /// vigente.
    #[error("pricing oracle unavailable: {0}")]
    OracleUnavailable(String),
    /// Guardado fallido; la sesión queda sucia y visible como error.
    #[error("save failed: {0}")]
    SaveFailed(String),
    #[error("draft {draft_id} is corrupted: {reason}")]
    RecoveryCorrupted { draft_id: Uuid, reason: String },
    /// El borrador leído es más viejo que el listado al inicializar.
    #[error("draft {draft_id} is stale: listed version {listed}, loaded version {found}")]
    RecoveryStale { draft_id: Uuid, listed: u64, found: u64 },
    #[error("draft not found: {0}")]
    DraftNotFound(Uuid),
    #[error("store error: {0}")]
    Store(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("internal: {0}")]
    Internal(String),
}

/// Clasificación gruesa para logging y códigos de salida.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Transient,
    Corruption,
    Permanent,
}

pub fn classify_error(e: &FlowError) -> ErrorClass {
    match e {
        FlowError::ValidationRejected(_) => ErrorClass::Validation,
        FlowError::OracleUnavailable(_)
        | FlowError::SaveFailed(_)
        | FlowError::Store(_)
        | FlowError::RecoveryStale { .. } => ErrorClass::Transient,
        FlowError::RecoveryCorrupted { .. } => ErrorClass::Corruption,
        FlowError::DraftNotFound(_) | FlowError::Config(_) | FlowError::Internal(_) => ErrorClass::Permanent,
    }
}
