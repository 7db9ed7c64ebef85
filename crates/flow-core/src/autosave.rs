//! AutoSave: persistencia periódica del borrador de la sesión activa.
//!
//! Máquina de estados: `Clean → Dirty → Saving → Clean`, o
//! `Saving → Dirty` con error visible si la escritura falla.
//!
//! A lo sumo hay un "vuelo" de guardado por sesión. Un vuelo se arma con un
//! retardo (el intervalo de autosave, o cero si es inmediato) y, mientras no
//! haya empezado a escribir, cualquier llamada se une a él. Una vez que
//! escribe, recibe su mismo resultado toda llamada cuyo estado ya esté
//! incluido en esa escritura. Sólo una llamada inmediata con un estado más
//! nuevo espera a que termine y arma otro vuelo.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flow_domain::{GuidedFlowData, SaveReason, SessionContext, SessionDraft};
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::FlowError;
use crate::repo::DraftStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SaveState {
    Clean,
    Dirty,
    Saving,
}

/// Resultado de un guardado. `coalesced` indica que la llamada se unió a un
/// vuelo ya existente en lugar de iniciar una escritura propia.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReceipt {
    pub draft_id: Uuid,
    pub version: u64,
    pub saved_at: DateTime<Utc>,
    pub coalesced: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutoSaveStatus {
    pub state: SaveState,
    pub draft_id: Uuid,
    /// Última versión persistida, si hubo alguna.
    pub version: Option<u64>,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub last_error: Option<FlowError>,
    pub save_pending: bool,
    pub closed: bool,
}

type SharedSave = Shared<BoxFuture<'static, Result<SaveReceipt, FlowError>>>;

enum SaveStep {
    Join(SharedSave, bool),
    WaitWriting(SharedSave),
}

struct Candidate {
    data: GuidedFlowData,
    current_step: usize,
    revision: u64,
}

struct Flight {
    id: u64,
    fire_now: Arc<Notify>,
    writing: bool,
    /// Revisión del candidato que se está escribiendo (con `writing`).
    revision: u64,
    reason: SaveReason,
    abort: AbortHandle,
    result: SharedSave,
}

struct SaveSlot {
    state: SaveState,
    candidate: Option<Candidate>,
    flight: Option<Flight>,
    next_flight: u64,
    draft_id: Uuid,
    created_at: Option<DateTime<Utc>>,
    version: Option<u64>,
    last_saved_at: Option<DateTime<Utc>>,
    last_error: Option<FlowError>,
    closed: bool,
}

impl SaveSlot {
    /// Registra el candidato; sólo un contenido distinto cuenta como edición.
    fn record(&mut self, data: GuidedFlowData, current_step: usize) -> bool {
        let unchanged = self.candidate
                            .as_ref()
                            .map(|c| c.current_step == current_step && c.data == data)
                            .unwrap_or(false);
        if unchanged {
            return false;
        }
        let revision = self.candidate.as_ref().map(|c| c.revision + 1).unwrap_or(1);
        self.candidate = Some(Candidate { data, current_step, revision });
        if self.state == SaveState::Clean {
            self.state = SaveState::Dirty;
        }
        true
    }
}

struct Inner {
    session: SessionContext,
    store: Arc<dyn DraftStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    store_timeout: Duration,
    slot: Mutex<SaveSlot>,
}

#[derive(Clone)]
pub struct AutoSaveCoordinator {
    inner: Arc<Inner>,
}

impl AutoSaveCoordinator {
    pub fn new(session: SessionContext,
               store: Arc<dyn DraftStore>,
               clock: Arc<dyn Clock>,
               interval: Duration,
               store_timeout: Duration)
               -> Self {
        let slot = SaveSlot { state: SaveState::Clean,
                              candidate: None,
                              flight: None,
                              next_flight: 0,
                              draft_id: Uuid::new_v4(),
                              created_at: None,
                              version: None,
                              last_saved_at: None,
                              last_error: None,
                              closed: false };
        Self { inner: Arc::new(Inner { session,
                                       store,
                                       clock,
                                       interval,
                                       store_timeout,
                                       slot: Mutex::new(slot) }) }
    }

    fn lock(&self) -> MutexGuard<'_, SaveSlot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registra el último estado para el próximo tick y marca la sesión
    /// sucia. Arma el temporizador si no hay un guardado pendiente.
    pub fn set_current_session(&self, data: GuidedFlowData, current_step: usize) {
        let mut slot = self.lock();
        if slot.closed {
            debug!("autosave:set_session:ignored_closed estimate_id={}", self.inner.session.estimate_id);
            return;
        }
        if slot.record(data, current_step) && slot.flight.is_none() {
            self.arm(&mut slot, self.inner.interval, SaveReason::AutoSave);
        }
    }

    /// Persiste un borrador con `data`.
    ///
    /// Sin `immediate` espera al próximo tick del intervalo (o se une al
    /// guardado ya programado). Con `immediate` dispara el guardado ya.
    ///
    /// # Errores
    /// `FlowError::SaveFailed` si la escritura falla o excede
    /// `store_timeout`; la sesión queda sucia y el error visible en
    /// `status()`.
    pub async fn save_draft(&self,
                            data: GuidedFlowData,
                            current_step: usize,
                            immediate: bool)
                            -> Result<SaveReceipt, FlowError> {
        let mut data = Some(data);
        loop {
            let step = {
                let mut slot = self.lock();
                if slot.closed {
                    return Err(FlowError::SaveFailed("autosave is closed for this session".into()));
                }
                if let Some(d) = data.take() {
                    slot.record(d, current_step);
                }
                let wanted = slot.candidate.as_ref().map(|c| c.revision).unwrap_or(0);
                let estimate_id = &self.inner.session.estimate_id;
                match slot.flight.as_mut() {
                    Some(f) if !f.writing => {
                        if immediate {
                            f.reason = SaveReason::ManualSave;
                            f.fire_now.notify_one();
                        }
                        debug!("autosave:save:join_scheduled estimate_id={estimate_id} flight={}", f.id);
                        SaveStep::Join(f.result.clone(), true)
                    }
                    // Lo que está escribiendo no incluye este estado: esperar
                    // y armar otro vuelo.
                    Some(f) if immediate && f.revision < wanted => {
                        debug!("autosave:save:wait_in_flight estimate_id={estimate_id} flight={} writing={} wanted={}",
                               f.id, f.revision, wanted);
                        SaveStep::WaitWriting(f.result.clone())
                    }
                    Some(f) => {
                        debug!("autosave:save:join_in_flight estimate_id={estimate_id} flight={}", f.id);
                        SaveStep::Join(f.result.clone(), true)
                    }
                    None => {
                        let (delay, reason) = if immediate {
                            (Duration::ZERO, SaveReason::ManualSave)
                        } else {
                            (self.inner.interval, SaveReason::AutoSave)
                        };
                        SaveStep::Join(self.arm(&mut slot, delay, reason), false)
                    }
                }
            };
            match step {
                SaveStep::WaitWriting(writing) => {
                    let _ = writing.await;
                }
                SaveStep::Join(pending, coalesced) => {
                    let mut receipt = pending.await?;
                    receipt.coalesced = coalesced;
                    return Ok(receipt);
                }
            }
        }
    }

    /// Guardado inmediato previo a abandonar la sesión. Tras él no se
    /// aceptan más guardados.
    pub async fn save_and_exit(&self, data: GuidedFlowData, current_step: usize) -> Result<SaveReceipt, FlowError> {
        let receipt = self.save_draft(data, current_step, true).await?;
        self.close();
        debug!("autosave:save_and_exit:ok estimate_id={} version={}",
               self.inner.session.estimate_id, receipt.version);
        Ok(receipt)
    }

    pub fn status(&self) -> AutoSaveStatus {
        let slot = self.lock();
        AutoSaveStatus { state: slot.state,
                         draft_id: slot.draft_id,
                         version: slot.version,
                         last_saved_at: slot.last_saved_at,
                         last_error: slot.last_error.clone(),
                         save_pending: slot.flight.is_some(),
                         closed: slot.closed }
    }

    /// Descarta el borrador persistido y el estado pendiente. El próximo
    /// guardado crea un borrador nuevo.
    pub async fn discard(&self) -> Result<bool, FlowError> {
        let draft_id = loop {
            let wait = {
                let mut slot = self.lock();
                match slot.flight.as_ref() {
                    Some(f) if f.writing => f.result.clone(),
                    _ => {
                        if let Some(f) = slot.flight.take() {
                            f.abort.abort();
                        }
                        let id = slot.draft_id;
                        slot.draft_id = Uuid::new_v4();
                        slot.candidate = None;
                        slot.created_at = None;
                        slot.version = None;
                        slot.last_error = None;
                        slot.state = SaveState::Clean;
                        break id;
                    }
                }
            };
            let _ = wait.await;
        };
        let deleted = match tokio::time::timeout(self.inner.store_timeout, self.inner.store.delete_draft(draft_id)).await {
            Ok(r) => r?,
            Err(_) => return Err(FlowError::Store(format!("delete of draft {draft_id} timed out"))),
        };
        debug!("autosave:discard estimate_id={} draft_id={} deleted={}",
               self.inner.session.estimate_id, draft_id, deleted);
        Ok(deleted)
    }

    /// Detiene el temporizador; un guardado que ya está escribiendo termina.
    pub fn shutdown(&self) {
        self.close();
    }

    fn close(&self) {
        let mut slot = self.lock();
        slot.closed = true;
        if slot.flight.as_ref().is_some_and(|f| !f.writing) {
            if let Some(f) = slot.flight.take() {
                f.abort.abort();
            }
        }
    }

    fn arm(&self, slot: &mut SaveSlot, delay: Duration, reason: SaveReason) -> SharedSave {
        slot.next_flight += 1;
        let id = slot.next_flight;
        let fire_now = Arc::new(Notify::new());
        let trigger = Arc::clone(&fire_now);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = trigger.notified() => {}
            }
            this.execute(id).await
        });
        let abort = handle.abort_handle();
        let result: SharedSave = handle.map(|joined| match joined {
                                           Ok(r) => r,
                                           Err(e) if e.is_cancelled() => Err(FlowError::SaveFailed("save cancelled".into())),
                                           Err(e) => Err(FlowError::Internal(format!("save task failed: {e}"))),
                                       })
                                       .boxed()
                                       .shared();
        debug!("autosave:arm estimate_id={} flight={} delay_ms={} reason={}",
               self.inner.session.estimate_id,
               id,
               delay.as_millis(),
               reason.as_str());
        slot.flight = Some(Flight { id,
                                    fire_now,
                                    writing: false,
                                    revision: 0,
                                    reason,
                                    abort,
                                    result: result.clone() });
        result
    }

    async fn execute(&self, flight_id: u64) -> Result<SaveReceipt, FlowError> {
        let (draft, revision) = {
            let mut slot = self.lock();
            let reason = match slot.flight.as_ref() {
                Some(f) if f.id == flight_id => f.reason,
                _ => return Err(FlowError::Internal(format!("save flight {flight_id} is no longer current"))),
            };
            let Some(candidate) = slot.candidate.as_ref() else {
                slot.flight = None;
                return Err(FlowError::SaveFailed("nothing to save".into()));
            };
            let mut draft = SessionDraft::new(slot.draft_id,
                                              &self.inner.session,
                                              candidate.data.clone(),
                                              candidate.current_step,
                                              reason,
                                              self.inner.clock.now());
            if let Some(created) = slot.created_at {
                draft.created_at = created;
            }
            let revision = candidate.revision;
            if let Some(f) = slot.flight.as_mut() {
                f.writing = true;
                f.revision = revision;
            }
            slot.state = SaveState::Saving;
            (draft, revision)
        };
        debug!("autosave:save:start estimate_id={} draft_id={} revision={} reason={}",
               self.inner.session.estimate_id,
               draft.id,
               revision,
               draft.save_reason.as_str());

        let outcome = match tokio::time::timeout(self.inner.store_timeout, self.inner.store.put_draft(draft)).await {
            Ok(Ok(saved)) => Ok(saved),
            Ok(Err(e)) => Err(FlowError::SaveFailed(e.to_string())),
            Err(_) => Err(FlowError::SaveFailed(format!("store did not answer within {}ms",
                                                        self.inner.store_timeout.as_millis()))),
        };

        let mut slot = self.lock();
        if slot.flight.as_ref().is_some_and(|f| f.id == flight_id) {
            slot.flight = None;
        }
        match outcome {
            Ok(saved) => {
                slot.version = Some(saved.version);
                slot.created_at = Some(saved.created_at);
                slot.last_saved_at = Some(saved.updated_at);
                slot.last_error = None;
                let newer = slot.candidate.as_ref().is_some_and(|c| c.revision > revision);
                if newer && !slot.closed {
                    slot.state = SaveState::Dirty;
                    if slot.flight.is_none() {
                        self.arm(&mut slot, self.inner.interval, SaveReason::AutoSave);
                    }
                } else {
                    slot.state = SaveState::Clean;
                }
                debug!("autosave:save:ok estimate_id={} draft_id={} version={}",
                       self.inner.session.estimate_id, saved.id, saved.version);
                Ok(SaveReceipt { draft_id: saved.id,
                                 version: saved.version,
                                 saved_at: saved.updated_at,
                                 coalesced: false })
            }
            Err(e) => {
                slot.state = SaveState::Dirty;
                slot.last_error = Some(e.clone());
                warn!("autosave:save:failed estimate_id={} err={}", self.inner.session.estimate_id, e);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for AutoSaveCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoSaveCoordinator")
         .field("session", &self.inner.session)
         .field("interval", &self.inner.interval)
         .finish()
    }
}
