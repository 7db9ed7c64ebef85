//! `InMemoryDraftStore`: backend en memoria para tests y demos.
//!
//! Las filas se guardan serializadas (como lo haría un backend real), de
//! modo que un payload dañado se detecta al leer y no al escribir.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use flow_domain::{DraftSummary, SessionDraft};
use log::{debug, warn};
use uuid::Uuid;

use super::{DraftStore, StoreError};
use crate::clock::{not_before, Clock, SystemClock};

#[derive(Debug)]
pub struct InMemoryDraftStore {
    rows: DashMap<Uuid, String>,
    clock: Arc<dyn Clock>,
    latency: Option<Duration>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl Default for InMemoryDraftStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryDraftStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { rows: DashMap::new(),
               clock,
               latency: None,
               failing: AtomicBool::new(false),
               writes: AtomicUsize::new(0) }
    }

    /// Simula la latencia de red de cada operación (`tokio::time::sleep`).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Mientras esté activo, toda operación falla con `StoreError::Transient`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Cantidad de `put_draft` exitosos desde la creación.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sobrescribe el payload crudo de una fila (para simular corrupción).
    pub fn overwrite_raw(&self, id: Uuid, raw: impl Into<String>) {
        self.rows.insert(id, raw.into());
    }

    async fn io(&self, op: &str) -> Result<(), StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            warn!("memory_store:{op}:failed reason=simulated");
            return Err(StoreError::Transient(format!("simulated failure during {op}")));
        }
        Ok(())
    }
}

fn decode(id: Uuid, raw: &str) -> Result<SessionDraft, StoreError> {
    let draft: SessionDraft =
        serde_json::from_str(raw).map_err(|e| StoreError::Corrupted { id, reason: e.to_string() })?;
    draft.verify_checksum()
         .map_err(|e| StoreError::Corrupted { id, reason: e.to_string() })?;
    Ok(draft)
}

#[async_trait]
impl DraftStore for InMemoryDraftStore {
    async fn put_draft(&self, mut draft: SessionDraft) -> Result<SessionDraft, StoreError> {
        self.io("put").await?;
        let previous = self.rows
                           .get(&draft.id)
                           .and_then(|raw| serde_json::from_str::<SessionDraft>(raw.value()).ok());
        let now = self.clock.now();
        match previous {
            Some(prev) => {
                draft.version = prev.version + 1;
                draft.created_at = prev.created_at;
                draft.updated_at = not_before(now, Some(prev.updated_at));
            }
            None => {
                draft.version = 1;
                draft.updated_at = not_before(now, Some(draft.created_at));
            }
        }
        let raw = serde_json::to_string(&draft).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.rows.insert(draft.id, raw);
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!("memory_store:put:ok draft_id={} version={}", draft.id, draft.version);
        Ok(draft)
    }

    async fn get_draft(&self, id: Uuid) -> Result<Option<SessionDraft>, StoreError> {
        self.io("get").await?;
        let raw = match self.rows.get(&id) {
            Some(r) => r.value().clone(),
            None => return Ok(None),
        };
        decode(id, &raw).map(Some)
    }

    async fn delete_draft(&self, id: Uuid) -> Result<bool, StoreError> {
        self.io("delete").await?;
        Ok(self.rows.remove(&id).is_some())
    }

    async fn list_drafts(&self, principal_id: &str) -> Result<Vec<DraftSummary>, StoreError> {
        self.io("list").await?;
        let mut out: Vec<DraftSummary> = Vec::new();
        for row in self.rows.iter() {
            // El listado sólo necesita metadatos: el checksum se verifica al
            // recuperar.
            match serde_json::from_str::<SessionDraft>(row.value()) {
                Ok(d) if d.principal_id == principal_id => out.push(d.summary()),
                Ok(_) => {}
                Err(e) => warn!("memory_store:list:skip_unreadable draft_id={} err={}", row.key(), e),
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use flow_domain::{GuidedFlowData, SaveReason, SessionContext};
    use serde_json::json;

    fn draft(clock: &ManualClock, principal: &str, estimate: &str) -> SessionDraft {
        let data = GuidedFlowData::new().with_step("step1", json!({"glassArea": 100}));
        SessionDraft::new(Uuid::new_v4(),
                          &SessionContext::new(principal, estimate),
                          data,
                          0,
                          SaveReason::AutoSave,
                          clock.now())
    }

    #[tokio::test]
    async fn put_assigns_increasing_versions_and_keeps_created_at() {
        let clock = ManualClock::default();
        let store = InMemoryDraftStore::new(Arc::new(clock.clone()));
        let d = draft(&clock, "u1", "e1");
        let first = store.put_draft(d.clone()).await.unwrap();
        clock.advance(chrono::Duration::seconds(3));
        let mut next = d.clone();
        next.version = 99;
        let second = store.put_draft(next).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn list_is_scoped_by_principal_and_sorted_by_recency() {
        let clock = ManualClock::default();
        let store = InMemoryDraftStore::new(Arc::new(clock.clone()));
        let older = store.put_draft(draft(&clock, "u1", "e1")).await.unwrap();
        clock.advance(chrono::Duration::seconds(10));
        let newer = store.put_draft(draft(&clock, "u1", "e2")).await.unwrap();
        store.put_draft(draft(&clock, "u2", "e3")).await.unwrap();
        let listed = store.list_drafts("u1").await.unwrap();
        assert_eq!(listed.iter().map(|s| s.id).collect::<Vec<_>>(), vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn tampered_payload_reads_as_corrupted() {
        let clock = ManualClock::default();
        let store = InMemoryDraftStore::new(Arc::new(clock.clone()));
        let saved = store.put_draft(draft(&clock, "u1", "e1")).await.unwrap();
        let mut tampered = saved.clone();
        tampered.data.set_step("step1", json!({"glassArea": 1}));
        store.overwrite_raw(saved.id, serde_json::to_string(&tampered).unwrap());
        assert!(matches!(store.get_draft(saved.id).await, Err(StoreError::Corrupted { .. })));
        // Sigue listado: la corrupción se descubre al recuperar.
        assert_eq!(store.list_drafts("u1").await.unwrap().len(), 1);

        store.overwrite_raw(saved.id, "{not json");
        assert!(matches!(store.get_draft(saved.id).await, Err(StoreError::Corrupted { .. })));
        assert!(store.list_drafts("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_mode_and_delete() {
        let store = InMemoryDraftStore::default();
        let clock = ManualClock::default();
        let saved = store.put_draft(draft(&clock, "u1", "e1")).await.unwrap();
        store.set_failing(true);
        assert!(matches!(store.get_draft(saved.id).await, Err(StoreError::Transient(_))));
        store.set_failing(false);
        assert!(store.delete_draft(saved.id).await.unwrap());
        assert!(!store.delete_draft(saved.id).await.unwrap());
        assert_eq!(store.get_draft(saved.id).await.unwrap(), None);
    }
}
