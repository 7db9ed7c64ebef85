//! Recuperación de sesiones abandonadas.
//!
//! Fases: `Uninitialized → Initializing → {Idle | RecoveryPending}`;
//! `RecoveryPending → Recovered` al aceptar (y `Recovered → Idle` con
//! `acknowledge`), `RecoveryPending → Idle` al declinar.
//!
//! La señal "hay recuperación disponible" se emite a lo sumo una vez por
//! instancia. Un borrador que no se puede cargar se reporta y se retira de
//! la lista sin impedir la recuperación de los demás.
//!
//! Aceptar es un protocolo en dos pasos: `recover_session` carga el borrador
//! en el `FlowDataStore` y lo deja pendiente de commit; `commit_recovery`
//! borra el original. Entre ambos, quien llama persiste el estado
//! recuperado.
//!
//! Por estimación sólo se ofrece el borrador más reciente (`updated_at`,
//! luego `version`); los demás quedan en `stale_drafts`.
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use flow_domain::{DraftSummary, SessionContext, SessionDraft};
use log::{debug, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::FlowError;
use crate::hub::{Subscription, SubscriptionHub};
use crate::repo::{DraftStore, StoreError};
use crate::store::FlowDataStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryPhase {
    Uninitialized,
    Initializing,
    Idle,
    RecoveryPending,
    Recovered,
}

/// Filtros de candidatos.
#[derive(Debug, Clone, Default)]
pub struct RecoveryOptions {
    /// Sólo borradores de esta estimación.
    pub estimate_id: Option<String>,
    /// Descarta borradores más viejos que esto.
    pub max_age: Option<chrono::Duration>,
}

impl RecoveryOptions {
    pub fn for_estimate(estimate_id: impl Into<String>) -> Self {
        Self { estimate_id: Some(estimate_id.into()),
               max_age: None }
    }

    pub fn with_max_age(mut self, max_age: chrono::Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryState {
    pub phase: RecoveryPhase,
    pub has_recoverable_sessions: bool,
    /// Más recientes primero, sin repetidos, uno por estimación.
    pub available_drafts: Vec<DraftSummary>,
    /// Borradores superados por otro más reciente de la misma estimación.
    pub stale_drafts: Vec<DraftSummary>,
    pub errors: Vec<FlowError>,
    pub last_recovered: Option<Uuid>,
    /// Borrador ya cargado cuyo original todavía no se borró.
    pub pending_commit: Option<Uuid>,
}

impl RecoveryState {
    fn new() -> Self {
        Self { phase: RecoveryPhase::Uninitialized,
               has_recoverable_sessions: false,
               available_drafts: vec![],
               stale_drafts: vec![],
               errors: vec![],
               last_recovered: None,
               pending_commit: None }
    }

    fn listed_version(&self, id: Uuid) -> Option<u64> {
        self.available_drafts
            .iter()
            .chain(&self.stale_drafts)
            .find(|d| d.id == id)
            .map(|d| d.version)
    }

    fn forget(&mut self, id: Uuid) {
        self.available_drafts.retain(|d| d.id != id);
        self.stale_drafts.retain(|d| d.id != id);
        self.has_recoverable_sessions = !self.available_drafts.is_empty();
        if !self.has_recoverable_sessions && self.phase == RecoveryPhase::RecoveryPending {
            self.phase = RecoveryPhase::Idle;
        }
    }
}

pub struct RecoveryManager {
    session: SessionContext,
    store: Arc<dyn DraftStore>,
    flow: FlowDataStore,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    state: Mutex<RecoveryState>,
    signaled: AtomicBool,
    available: SubscriptionHub<RecoveryState>,
}

impl RecoveryManager {
    pub fn new(session: SessionContext,
               store: Arc<dyn DraftStore>,
               flow: FlowDataStore,
               clock: Arc<dyn Clock>,
               store_timeout: Duration)
               -> Self {
        Self { session,
               store,
               flow,
               clock,
               store_timeout,
               state: Mutex::new(RecoveryState::new()),
               signaled: AtomicBool::new(false),
               available: SubscriptionHub::new("recovery") }
    }

    fn lock(&self) -> MutexGuard<'_, RecoveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> RecoveryState {
        self.lock().clone()
    }

    /// Registra el listener de "recuperación disponible". Sólo se invoca una
    /// vez, en el primer `initialize` que encuentra candidatos.
    pub fn on_recovery_available<F>(&self, callback: F) -> Subscription
        where F: Fn(&RecoveryState) + Send + Sync + 'static
    {
        self.available.subscribe(&self.session.principal_id, callback)
    }

    async fn with_timeout<T, F>(&self, op: &str, fut: F) -> Result<T, FlowError>
        where F: std::future::Future<Output = Result<T, StoreError>>
    {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(r) => r.map_err(FlowError::from),
            Err(_) => Err(FlowError::Store(format!("{op} timed out after {}ms", self.store_timeout.as_millis()))),
        }
    }

    /// Busca borradores del principal actual.
    ///
    /// # Errores
    /// `FlowError::Store` si el listado falla; la fase queda en `Idle`.
    pub async fn initialize(&self, options: RecoveryOptions) -> Result<RecoveryState, FlowError> {
        self.lock().phase = RecoveryPhase::Initializing;
        let listed = self.with_timeout("list_drafts", self.store.list_drafts(&self.session.principal_id))
                         .await;
        let listed = match listed {
            Ok(l) => l,
            Err(e) => {
                let mut st = self.lock();
                st.phase = RecoveryPhase::Idle;
                st.errors.push(e.clone());
                warn!("recovery:initialize:list_failed principal={} err={}", self.session.principal_id, e);
                return Err(e);
            }
        };

        let now = self.clock.now();
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut drafts: Vec<DraftSummary> =
            listed.into_iter()
                  .filter(|d| d.principal_id == self.session.principal_id)
                  .filter(|d| options.estimate_id.as_deref().map_or(true, |e| d.estimate_id == e))
                  .filter(|d| options.max_age.map_or(true, |age| now - d.updated_at <= age))
                  .filter(|d| seen.insert(d.id))
                  .collect();
        drafts.sort_by(|a, b| {
                  b.updated_at
                   .cmp(&a.updated_at)
                   .then_with(|| b.version.cmp(&a.version))
                   .then_with(|| a.id.cmp(&b.id))
              });
        let mut estimates: HashSet<String> = HashSet::new();
        let (fresh, stale): (Vec<DraftSummary>, Vec<DraftSummary>) =
            drafts.into_iter().partition(|d| estimates.insert(d.estimate_id.clone()));

        let snapshot = {
            let mut st = self.lock();
            st.has_recoverable_sessions = !fresh.is_empty();
            st.phase = if fresh.is_empty() {
                RecoveryPhase::Idle
            } else {
                RecoveryPhase::RecoveryPending
            };
            st.available_drafts = fresh;
            st.stale_drafts = stale;
            st.clone()
        };
        debug!("recovery:initialize principal={} candidates={} stale={}",
               self.session.principal_id,
               snapshot.available_drafts.len(),
               snapshot.stale_drafts.len());
        if snapshot.has_recoverable_sessions && !self.signaled.swap(true, Ordering::SeqCst) {
            self.available.publish(&self.session.principal_id, &snapshot);
        }
        Ok(snapshot)
    }

    /// Carga el borrador en el `FlowDataStore` y lo deja pendiente de
    /// `commit_recovery`; el original sigue en el store hasta entonces.
    ///
    /// Devuelve `Ok(None)` si el borrador no existe, está corrupto o es más
    /// viejo que lo listado en `initialize`; el motivo queda en
    /// `state().errors`. Los inexistentes y corruptos salen de la lista; un
    /// borrador viejo sigue listado y se puede reintentar.
    ///
    /// # Errores
    /// `FlowError::Store` ante fallos de transporte (el borrador sigue
    /// listado y se puede reintentar).
    pub async fn recover_session(&self, draft_id: Uuid) -> Result<Option<SessionDraft>, FlowError> {
        let listed = self.lock().listed_version(draft_id);
        let loaded = match self.with_timeout("get_draft", self.store.get_draft(draft_id)).await {
            Ok(Some(d)) if d.principal_id == self.session.principal_id => Ok(d),
            Ok(_) => Err(FlowError::DraftNotFound(draft_id)),
            Err(e @ FlowError::RecoveryCorrupted { .. }) => Err(e),
            Err(e) => return Err(e),
        };
        let checked = loaded.and_then(|d| match d.verify_checksum() {
                                Ok(()) => Ok(d),
                                Err(e) => Err(FlowError::RecoveryCorrupted { draft_id,
                                                                             reason: e.to_string() }),
                            })
                            .and_then(|d| match listed {
                                Some(v) if d.version < v => Err(FlowError::RecoveryStale { draft_id,
                                                                                           listed: v,
                                                                                           found: d.version }),
                                _ => Ok(d),
                            });
        let draft = match checked {
            Ok(d) => d,
            Err(e) => {
                warn!("recovery:recover:unusable draft_id={draft_id} err={e}");
                let mut st = self.lock();
                if !matches!(e, FlowError::RecoveryStale { .. }) {
                    st.forget(draft_id);
                }
                st.errors.push(e);
                return Ok(None);
            }
        };

        self.flow.replace(draft.data.clone(), draft.current_step);
        {
            let mut st = self.lock();
            st.forget(draft_id);
            st.phase = RecoveryPhase::Recovered;
            st.last_recovered = Some(draft_id);
            if let Some(previous) = st.pending_commit.replace(draft_id) {
                // Su contenido ya no está cargado: queda como borrador.
                debug!("recovery:recover:pending_commit_replaced previous={previous} draft_id={draft_id}");
            }
        }
        debug!("recovery:recover:loaded draft_id={} version={} step={}",
               draft_id, draft.version, draft.current_step);
        Ok(Some(draft))
    }

    /// Borra el original del último borrador recuperado. Llamar sólo con el
    /// estado recuperado ya persistido. `Ok(false)` si no había nada
    /// pendiente o el original ya no existía.
    ///
    /// # Errores
    /// `FlowError::Store` si el borrado falla; el commit sigue pendiente.
    pub async fn commit_recovery(&self) -> Result<bool, FlowError> {
        let Some(draft_id) = self.lock().pending_commit else { return Ok(false) };
        match self.with_timeout("delete_draft", self.store.delete_draft(draft_id)).await {
            Ok(deleted) => {
                let mut st = self.lock();
                if st.pending_commit == Some(draft_id) {
                    st.pending_commit = None;
                }
                debug!("recovery:commit draft_id={draft_id} deleted={deleted}");
                Ok(deleted)
            }
            Err(e) => {
                warn!("recovery:commit:delete_origin_failed draft_id={draft_id} err={e}");
                self.lock().errors.push(e.clone());
                Err(e)
            }
        }
    }

    /// `Recovered → Idle`.
    pub fn acknowledge(&self) {
        let mut st = self.lock();
        if st.phase == RecoveryPhase::Recovered {
            st.phase = RecoveryPhase::Idle;
        }
    }

    /// Borra todos los candidatos, viejos incluidos (irreversible). Devuelve
    /// cuántos se borraron; los fallos quedan en `state().errors`.
    pub async fn decline_recovery(&self) -> Result<usize, FlowError> {
        let candidates: Vec<Uuid> = {
            let st = self.lock();
            st.available_drafts.iter().chain(&st.stale_drafts).map(|d| d.id).collect()
        };
        let mut deleted = 0;
        for id in candidates {
            match self.with_timeout("delete_draft", self.store.delete_draft(id)).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("recovery:decline:delete_failed draft_id={id} err={e}");
                    self.lock().errors.push(e);
                    continue;
                }
            }
            self.lock().forget(id);
        }
        let mut st = self.lock();
        if st.phase == RecoveryPhase::RecoveryPending {
            st.phase = RecoveryPhase::Idle;
        }
        debug!("recovery:decline principal={} deleted={}", self.session.principal_id, deleted);
        Ok(deleted)
    }

    pub async fn delete_draft(&self, draft_id: Uuid) -> Result<bool, FlowError> {
        let deleted = self.with_timeout("delete_draft", self.store.delete_draft(draft_id)).await?;
        self.lock().forget(draft_id);
        debug!("recovery:delete draft_id={draft_id} deleted={deleted}");
        Ok(deleted)
    }
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
         .field("session", &self.session)
         .field("phase", &self.lock().phase)
         .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::graph::{DependencyGraph, StepRole, StepSpec};
    use crate::repo::InMemoryDraftStore;
    use flow_domain::{GuidedFlowData, SaveReason};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        clock: ManualClock,
        store: Arc<InMemoryDraftStore>,
        flow: FlowDataStore,
        manager: RecoveryManager,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryDraftStore::new(Arc::new(clock.clone())));
        let graph = DependencyGraph::builder().step(StepSpec::new("step1", StepRole::Measurements))
                                              .build()
                                              .unwrap();
        let flow = FlowDataStore::new(Arc::new(graph));
        let manager = RecoveryManager::new(SessionContext::new("u1", "e-new"),
                                           store.clone(),
                                           flow.clone(),
                                           Arc::new(clock.clone()),
                                           Duration::from_secs(5));
        Fixture { clock,
                  store,
                  flow,
                  manager }
    }

    async fn seed(f: &Fixture, principal: &str, estimate: &str, area: i64) -> SessionDraft {
        let data = GuidedFlowData::new().with_step("step1", json!({ "glassArea": area }));
        let draft = SessionDraft::new(Uuid::new_v4(),
                                      &SessionContext::new(principal, estimate),
                                      data,
                                      1,
                                      SaveReason::AutoSave,
                                      f.clock.now());
        let saved = f.store.put_draft(draft).await.unwrap();
        f.clock.advance(chrono::Duration::seconds(10));
        saved
    }

    #[tokio::test]
    async fn initialize_lists_each_draft_once_by_recency_and_signals_once() {
        let f = fixture();
        let a = seed(&f, "u1", "e1", 1).await;
        let b = seed(&f, "u1", "e2", 2).await;
        seed(&f, "u2", "e3", 3).await;

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _sub = f.manager.on_recovery_available(move |_| {
                                 h.fetch_add(1, Ordering::SeqCst);
                             });
        let st = f.manager.initialize(RecoveryOptions::default()).await.unwrap();
        assert_eq!(st.phase, RecoveryPhase::RecoveryPending);
        assert!(st.has_recoverable_sessions);
        assert_eq!(st.available_drafts.iter().map(|d| d.id).collect::<Vec<_>>(), vec![b.id, a.id]);

        f.manager.initialize(RecoveryOptions::default()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn options_filter_by_estimate_and_age() {
        let f = fixture();
        seed(&f, "u1", "e1", 1).await;
        let recent = seed(&f, "u1", "e2", 2).await;
        let st = f.manager.initialize(RecoveryOptions::for_estimate("e2")).await.unwrap();
        assert_eq!(st.available_drafts.len(), 1);
        let st = f.manager
                  .initialize(RecoveryOptions::default().with_max_age(chrono::Duration::seconds(15)))
                  .await
                  .unwrap();
        assert_eq!(st.available_drafts.iter().map(|d| d.id).collect::<Vec<_>>(), vec![recent.id]);
    }

    #[tokio::test]
    async fn accept_loads_data_and_commit_deletes_origin() {
        let f = fixture();
        let d = seed(&f, "u1", "e1", 5000).await;
        f.manager.initialize(RecoveryOptions::default()).await.unwrap();
        let recovered = f.manager.recover_session(d.id).await.unwrap().unwrap();
        assert_eq!(recovered.data, d.data);
        assert_eq!(*f.flow.data(), d.data);
        assert_eq!(f.flow.current_step(), 1);
        let st = f.manager.state();
        assert_eq!(st.phase, RecoveryPhase::Recovered);
        assert_eq!(st.last_recovered, Some(d.id));
        assert_eq!(st.pending_commit, Some(d.id));
        // Hasta el commit el original sigue guardado.
        assert!(f.store.get_draft(d.id).await.unwrap().is_some());

        assert!(f.manager.commit_recovery().await.unwrap());
        assert_eq!(f.store.get_draft(d.id).await.unwrap(), None);
        assert_eq!(f.manager.state().pending_commit, None);
        assert!(!f.manager.commit_recovery().await.unwrap());
        f.manager.acknowledge();
        assert_eq!(f.manager.state().phase, RecoveryPhase::Idle);
    }

    #[tokio::test]
    async fn failed_commit_keeps_origin_and_stays_pending() {
        let f = fixture();
        let d = seed(&f, "u1", "e1", 10).await;
        f.manager.initialize(RecoveryOptions::default()).await.unwrap();
        f.manager.recover_session(d.id).await.unwrap().unwrap();
        f.store.set_failing(true);
        assert!(matches!(f.manager.commit_recovery().await, Err(FlowError::Store(_))));
        assert_eq!(f.manager.state().pending_commit, Some(d.id));
        f.store.set_failing(false);
        assert!(f.store.get_draft(d.id).await.unwrap().is_some());
        assert!(f.manager.commit_recovery().await.unwrap());
    }

    #[tokio::test]
    async fn older_drafts_of_the_same_estimate_are_stale() {
        let f = fixture();
        let old = seed(&f, "u1", "e1", 1).await;
        let newer = seed(&f, "u1", "e1", 2).await;
        let other = seed(&f, "u1", "e2", 3).await;
        let st = f.manager.initialize(RecoveryOptions::default()).await.unwrap();
        assert_eq!(st.available_drafts.iter().map(|d| d.id).collect::<Vec<_>>(), vec![other.id, newer.id]);
        assert_eq!(st.stale_drafts.iter().map(|d| d.id).collect::<Vec<_>>(), vec![old.id]);

        assert_eq!(f.manager.decline_recovery().await.unwrap(), 3);
        assert!(f.store.is_empty());
        assert!(f.manager.state().stale_drafts.is_empty());
    }

    #[tokio::test]
    async fn draft_older_than_listed_version_is_rejected() {
        let f = fixture();
        let v1 = seed(&f, "u1", "e1", 1).await;
        let v2 = f.store.put_draft(v1.clone()).await.unwrap();
        assert_eq!(v2.version, 2);
        f.manager.initialize(RecoveryOptions::default()).await.unwrap();
        // El store devuelve una copia anterior a la listada.
        f.store.overwrite_raw(v1.id, serde_json::to_string(&v1).unwrap());

        assert_eq!(f.manager.recover_session(v1.id).await.unwrap(), None);
        let st = f.manager.state();
        assert!(matches!(st.errors.as_slice(),
                         [FlowError::RecoveryStale { listed: 2, found: 1, .. }]));
        assert_eq!(st.phase, RecoveryPhase::RecoveryPending);
        assert_eq!(st.available_drafts.len(), 1);
        assert!(f.flow.data().is_empty());

        f.store.overwrite_raw(v2.id, serde_json::to_string(&v2).unwrap());
        assert_eq!(f.manager.recover_session(v2.id).await.unwrap().map(|d| d.version), Some(2));
    }

    #[tokio::test]
    async fn corrupted_draft_is_reported_and_others_stay_recoverable() {
        let f = fixture();
        let good = seed(&f, "u1", "e1", 1).await;
        let bad = seed(&f, "u1", "e2", 2).await;
        let mut tampered = bad.clone();
        tampered.data.set_step("step1", json!({"glassArea": 999}));
        f.store.overwrite_raw(bad.id, serde_json::to_string(&tampered).unwrap());

        f.manager.initialize(RecoveryOptions::default()).await.unwrap();
        assert_eq!(f.manager.recover_session(bad.id).await.unwrap(), None);
        let st = f.manager.state();
        assert!(matches!(st.errors.as_slice(), [FlowError::RecoveryCorrupted { draft_id, .. }] if *draft_id == bad.id));
        assert_eq!(st.available_drafts.len(), 1);
        assert_eq!(st.phase, RecoveryPhase::RecoveryPending);

        assert!(f.manager.recover_session(good.id).await.unwrap().is_some());
        assert_eq!(f.manager.recover_session(Uuid::new_v4()).await.unwrap(), None);
        assert!(matches!(f.manager.state().errors.last(), Some(FlowError::DraftNotFound(_))));
    }

    #[tokio::test]
    async fn decline_deletes_every_candidate() {
        let f = fixture();
        seed(&f, "u1", "e1", 1).await;
        seed(&f, "u1", "e2", 2).await;
        f.manager.initialize(RecoveryOptions::default()).await.unwrap();
        assert_eq!(f.manager.decline_recovery().await.unwrap(), 2);
        let st = f.manager.state();
        assert_eq!(st.phase, RecoveryPhase::Idle);
        assert!(!st.has_recoverable_sessions);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn list_failure_surfaces_and_leaves_idle() {
        let f = fixture();
        f.store.set_failing(true);
        assert!(matches!(f.manager.initialize(RecoveryOptions::default()).await, Err(FlowError::Store(_))));
        assert_eq!(f.manager.state().phase, RecoveryPhase::Idle);
    }
}
