use async_trait::async_trait;
use flow_domain::{DraftSummary, SessionDraft};
use thiserror::Error;
use uuid::Uuid;

use crate::errors::FlowError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("draft not found: {0}")]
    NotFound(Uuid),
    #[error("draft {id} is corrupted: {reason}")]
    Corrupted { id: Uuid, reason: String },
    /// Fallo recuperable (conexión caída, timeout); reintentar tiene sentido.
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for FlowError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => FlowError::DraftNotFound(id),
            StoreError::Corrupted { id, reason } => FlowError::RecoveryCorrupted { draft_id: id, reason },
            other => FlowError::Store(other.to_string()),
        }
    }
}

/// Persistencia de borradores de sesión (last-write-wins).
///
/// El store es la autoridad sobre `version` y `updated_at`: `put_draft`
/// ignora los valores entrantes, asigna `version = previa + 1` y un
/// `updated_at` propio, conserva `created_at` de la fila existente y
/// devuelve el borrador tal como quedó persistido.
#[async_trait]
pub trait DraftStore: Send + Sync + std::fmt::Debug {
    async fn put_draft(&self, draft: SessionDraft) -> Result<SessionDraft, StoreError>;
    /// `Ok(None)` si no existe. Un payload ilegible o con checksum inválido
    /// es `StoreError::Corrupted`.
    async fn get_draft(&self, id: Uuid) -> Result<Option<SessionDraft>, StoreError>;
    /// Devuelve `true` si había algo que borrar.
    async fn delete_draft(&self, id: Uuid) -> Result<bool, StoreError>;
    /// Borradores del principal, más recientes primero.
    async fn list_drafts(&self, principal_id: &str) -> Result<Vec<DraftSummary>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_into_flow_taxonomy() {
        let id = Uuid::new_v4();
        assert_eq!(FlowError::from(StoreError::NotFound(id)), FlowError::DraftNotFound(id));
        let corrupted = StoreError::Corrupted { id, reason: "bad json".into() };
        assert_eq!(FlowError::from(corrupted),
                   FlowError::RecoveryCorrupted { draft_id: id,
                                                  reason: "bad json".into() });
        assert!(matches!(FlowError::from(StoreError::Transient("down".into())), FlowError::Store(m) if m.contains("down")));
    }
}
