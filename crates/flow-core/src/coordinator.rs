//! Coordinador genérico de recálculo por `estimate_id`.
//!
//! Es la maquinaria compartida por pricing y validación:
//! - Los disparos no inmediatos se agrupan en una ventana de debounce y el
//!   recálculo usa el último snapshot recibido.
//! - Cada disparo incrementa la generación de la clave. Un cálculo cuya
//!   generación quedó atrás descarta su resultado en lugar de publicarlo.
//! - Un mutex asíncrono por clave garantiza a lo sumo un recálculo en vuelo;
//!   la publicación ocurre con ese mutex tomado, de modo que los suscriptores
//!   ven los resultados en orden.
//! - Las marcas de tiempo publicadas nunca retroceden por clave (`not_before`).
//! - Un snapshot idéntico (mismo hash estructural) al último disparado se
//!   ignora salvo en llamadas inmediatas.
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flow_domain::{GuidedFlowData, StepId};
use log::{debug, warn};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::clock::not_before;
use crate::errors::FlowError;
use crate::hashing::flow_data_hash;
use crate::hub::{Subscription, SubscriptionHub};
use crate::scheduler::Debouncer;

/// Entrada de un recálculo: snapshot inmutable y steps cambiados desde el
/// último recálculo de la clave.
#[derive(Debug, Clone)]
pub struct RecomputeRequest {
    pub estimate_id: String,
    pub data: Arc<GuidedFlowData>,
    pub changed_steps: BTreeSet<StepId>,
    pub generation: u64,
}

/// Cálculo puro que el coordinador orquesta.
#[async_trait]
pub trait Recompute: Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    /// Prefijo de logs.
    const NAME: &'static str;

    async fn compute(&self, request: &RecomputeRequest) -> Result<Self::Output, FlowError>;

    fn stamp(output: &Self::Output) -> DateTime<Utc>;

    fn restamp(output: &mut Self::Output, at: DateTime<Utc>);
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome<O> {
    /// Quedó programado tras la ventana de debounce.
    Scheduled { generation: u64 },
    /// Mismo contenido que el último disparo; no se recalcula.
    Skipped,
    /// Recálculo inmediato publicado.
    Published(Arc<O>),
    /// Un disparo posterior dejó obsoleto este cálculo; no se publicó.
    Superseded,
}

struct KeyState<O> {
    generation: u64,
    last_hash: Option<String>,
    pending_changes: BTreeSet<StepId>,
    latest: Option<Arc<O>>,
    last_error: Option<FlowError>,
    gate: Arc<AsyncMutex<()>>,
}

impl<O> Default for KeyState<O> {
    fn default() -> Self {
        Self { generation: 0,
               last_hash: None,
               pending_changes: BTreeSet::new(),
               latest: None,
               last_error: None,
               gate: Arc::new(AsyncMutex::new(())) }
    }
}

struct Inner<R: Recompute> {
    engine: R,
    debounce: Duration,
    debouncer: Arc<Debouncer<String>>,
    states: DashMap<String, KeyState<R::Output>>,
    hub: SubscriptionHub<R::Output>,
}

pub struct KeyedCoordinator<R: Recompute> {
    inner: Arc<Inner<R>>,
}

impl<R: Recompute> Clone for KeyedCoordinator<R> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<R: Recompute> KeyedCoordinator<R> {
    pub fn new(engine: R, debounce: Duration) -> Self {
        Self { inner: Arc::new(Inner { engine,
                                       debounce,
                                       debouncer: Debouncer::new(R::NAME),
                                       states: DashMap::new(),
                                       hub: SubscriptionHub::new(R::NAME) }) }
    }

    pub fn engine(&self) -> &R {
        &self.inner.engine
    }

    pub fn subscribe<F>(&self, estimate_id: &str, callback: F) -> Subscription
        where F: Fn(&R::Output) + Send + Sync + 'static
    {
        self.inner.hub.subscribe(estimate_id, callback)
    }

    pub fn channel(&self, estimate_id: &str) -> (Subscription, mpsc::UnboundedReceiver<R::Output>) {
        self.inner.hub.channel(estimate_id)
    }

    pub fn latest(&self, estimate_id: &str) -> Option<Arc<R::Output>> {
        self.inner.states.get(estimate_id).and_then(|s| s.latest.clone())
    }

    pub fn last_error(&self, estimate_id: &str) -> Option<FlowError> {
        self.inner.states.get(estimate_id).and_then(|s| s.last_error.clone())
    }

    pub fn is_pending(&self, estimate_id: &str) -> bool {
        self.inner.debouncer.is_pending(&estimate_id.to_string())
    }

    /// Cancela el recálculo programado (no el que está en vuelo). El
    /// snapshot cancelado puede volver a dispararse tal cual.
    pub fn cancel_pending(&self, estimate_id: &str) -> bool {
        let cancelled = self.inner.debouncer.cancel(&estimate_id.to_string());
        if cancelled {
            self.forget_hash(estimate_id);
        }
        cancelled
    }

    pub fn shutdown(&self) {
        for key in self.inner.debouncer.cancel_all() {
            self.forget_hash(&key);
        }
    }

    /// `pending_changes` se conserva para el próximo recálculo.
    fn forget_hash(&self, estimate_id: &str) {
        if let Some(mut st) = self.inner.states.get_mut(estimate_id) {
            st.last_hash = None;
        }
    }

    /// Dispara un recálculo.
    ///
    /// Con `immediate = false` se programa tras la ventana de debounce y el
    /// error, si lo hay, queda en `last_error`. Con `immediate = true` se
    /// cancela lo programado, se calcula en línea y el error vuelve al
    /// llamador; el resultado previo sigue publicado en ambos casos.
    pub async fn update(&self,
                        data: Arc<GuidedFlowData>,
                        estimate_id: &str,
                        changed_step: Option<&str>,
                        immediate: bool)
                        -> Result<UpdateOutcome<R::Output>, FlowError> {
        let hash = flow_data_hash(&data);
        let generation = {
            let mut st = self.inner.states.entry(estimate_id.to_string()).or_default();
            if let Some(step) = changed_step {
                st.pending_changes.insert(step.to_string());
            }
            if !immediate && st.last_hash.as_deref() == Some(hash.as_str()) {
                debug!("{}:update:skip_identical estimate_id={}", R::NAME, estimate_id);
                return Ok(UpdateOutcome::Skipped);
            }
            st.generation += 1;
            st.last_hash = Some(hash);
            st.generation
        };

        if immediate {
            self.inner.debouncer.cancel(&estimate_id.to_string());
            return Ok(match self.run(estimate_id, data, generation).await? {
                          Some(out) => UpdateOutcome::Published(out),
                          None => UpdateOutcome::Superseded,
                      });
        }

        let weak: Weak<Inner<R>> = Arc::downgrade(&self.inner);
        let key = estimate_id.to_string();
        self.inner.debouncer.schedule(estimate_id.to_string(), self.inner.debounce, async move {
                                          let Some(inner) = weak.upgrade() else { return };
                                          let this = KeyedCoordinator { inner };
                                          if let Err(e) = this.run(&key, data, generation).await {
                                              warn!("{}:debounced:failed estimate_id={} generation={} err={}",
                                                    R::NAME, key, generation, e);
                                          }
                                      });
        Ok(UpdateOutcome::Scheduled { generation })
    }

    /// Calcula sobre `data` sin debounce ni publicación.
    pub async fn compute_now(&self, data: Arc<GuidedFlowData>, estimate_id: &str) -> Result<R::Output, FlowError> {
        let generation = self.inner.states.get(estimate_id).map(|s| s.generation).unwrap_or(0);
        let request = RecomputeRequest { estimate_id: estimate_id.to_string(),
                                         data,
                                         changed_steps: BTreeSet::new(),
                                         generation };
        self.inner.engine.compute(&request).await
    }

    async fn run(&self,
                 estimate_id: &str,
                 data: Arc<GuidedFlowData>,
                 generation: u64)
                 -> Result<Option<Arc<R::Output>>, FlowError> {
        let gate = match self.inner.states.get(estimate_id) {
            Some(st) => Arc::clone(&st.gate),
            None => return Ok(None),
        };
        let _in_flight = gate.lock().await;

        let changed_steps = {
            let Some(mut st) = self.inner.states.get_mut(estimate_id) else { return Ok(None) };
            if st.generation != generation {
                debug!("{}:recompute:stale_before_start estimate_id={} generation={} current={}",
                       R::NAME, estimate_id, generation, st.generation);
                return Ok(None);
            }
            std::mem::take(&mut st.pending_changes)
        };
        debug!("{}:recompute:start estimate_id={} generation={} changed={:?}",
               R::NAME, estimate_id, generation, changed_steps);
        let request = RecomputeRequest { estimate_id: estimate_id.to_string(),
                                         data,
                                         changed_steps,
                                         generation };
        let result = self.inner.engine.compute(&request).await;

        let Some(mut st) = self.inner.states.get_mut(estimate_id) else { return Ok(None) };
        match result {
            Ok(mut output) => {
                if st.generation != generation {
                    st.pending_changes.extend(request.changed_steps);
                    debug!("{}:recompute:discard_stale estimate_id={} generation={} current={}",
                           R::NAME, estimate_id, generation, st.generation);
                    return Ok(None);
                }
                let floor = st.latest.as_deref().map(R::stamp);
                let at = not_before(R::stamp(&output), floor);
                R::restamp(&mut output, at);
                let output = Arc::new(output);
                st.latest = Some(Arc::clone(&output));
                st.last_error = None;
                drop(st);
                let delivered = self.inner.hub.publish(estimate_id, &output);
                debug!("{}:publish estimate_id={} generation={} subscribers={}",
                       R::NAME, estimate_id, generation, delivered);
                Ok(Some(output))
            }
            Err(e) => {
                st.pending_changes.extend(request.changed_steps);
                if st.generation == generation {
                    // El mismo snapshot debe poder volver a dispararse.
                    st.last_hash = None;
                    st.last_error = Some(e.clone());
                }
                warn!("{}:recompute:failed estimate_id={} generation={} err={}",
                      R::NAME, estimate_id, generation, e);
                Err(e)
            }
        }
    }
}
