//! `FlowDataStore`: estado del formulario multi-step en memoria.
//!
//! Sólo el lado UI muta el store. Los coordinadores leen `FlowSnapshot`
//! (un `Arc` inmutable), así que nunca observan escrituras a medias.
use std::sync::{Arc, PoisonError, RwLock};

use flow_domain::{GuidedFlowData, StepId};
use serde_json::Value;

use crate::errors::FlowError;
use crate::graph::DependencyGraph;
use crate::validation::check_step_transition;

/// Copia puntual del store.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSnapshot {
    pub data: Arc<GuidedFlowData>,
    pub current_step: usize,
    /// Contador de mutaciones; crece en cada escritura.
    pub revision: u64,
}

#[derive(Debug)]
struct StoreState {
    data: Arc<GuidedFlowData>,
    current_step: usize,
    revision: u64,
}

#[derive(Debug, Clone)]
pub struct FlowDataStore {
    graph: Arc<DependencyGraph>,
    inner: Arc<RwLock<StoreState>>,
}

impl FlowDataStore {
    pub fn new(graph: Arc<DependencyGraph>) -> Self {
        Self { graph,
               inner: Arc::new(RwLock::new(StoreState { data: Arc::new(GuidedFlowData::new()),
                                                        current_step: 0,
                                                        revision: 0 })) }
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        let s = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        FlowSnapshot { data: Arc::clone(&s.data),
                       current_step: s.current_step,
                       revision: s.revision }
    }

    pub fn data(&self) -> Arc<GuidedFlowData> {
        self.snapshot().data
    }

    pub fn current_step(&self) -> usize {
        self.snapshot().current_step
    }

    pub fn revision(&self) -> u64 {
        self.snapshot().revision
    }

    /// Reemplaza el payload de un step. Los snapshots tomados antes no se
    /// ven afectados (copy-on-write).
    pub fn set_step(&self, step_id: impl Into<StepId>, payload: Value) -> FlowSnapshot {
        self.mutate(|data| {
                data.set_step(step_id, payload);
            })
    }

    pub fn remove_step(&self, step_id: &str) -> FlowSnapshot {
        self.mutate(|data| {
                data.remove_step(step_id);
            })
    }

    /// Sustituye todo el contenido; lo usa la recuperación de borradores.
    pub fn replace(&self, data: GuidedFlowData, current_step: usize) -> FlowSnapshot {
        let mut s = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        s.data = Arc::new(data);
        s.current_step = current_step;
        s.revision += 1;
        FlowSnapshot { data: Arc::clone(&s.data),
                       current_step: s.current_step,
                       revision: s.revision }
    }

    /// Mueve el step actual aplicando la regla de transición (diferencia de
    /// a lo sumo 1).
    ///
    /// # Errores
    /// `FlowError::ValidationRejected` si el salto es mayor.
    pub fn request_step(&self, requested: usize) -> Result<FlowSnapshot, FlowError> {
        let mut s = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        check_step_transition(s.current_step, requested)?;
        if s.current_step != requested {
            s.current_step = requested;
            s.revision += 1;
        }
        Ok(FlowSnapshot { data: Arc::clone(&s.data),
                          current_step: s.current_step,
                          revision: s.revision })
    }

    pub fn does_step_affect_pricing(&self, step_id: &str) -> bool {
        self.graph.does_step_affect_pricing(step_id)
    }

    fn mutate<F>(&self, f: F) -> FlowSnapshot
        where F: FnOnce(&mut GuidedFlowData)
    {
        let mut s = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(Arc::make_mut(&mut s.data));
        s.revision += 1;
        FlowSnapshot { data: Arc::clone(&s.data),
                       current_step: s.current_step,
                       revision: s.revision }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Computation, StepRole, StepSpec};
    use serde_json::json;

    fn store() -> FlowDataStore {
        let graph = DependencyGraph::builder().step(StepSpec::new("step1", StepRole::Measurements).feeds(Computation::Pricing))
                                              .step(StepSpec::new("step2", StepRole::Details))
                                              .build()
                                              .unwrap();
        FlowDataStore::new(Arc::new(graph))
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let s = store();
        let before = s.set_step("step1", json!({"glassArea": 10}));
        let after = s.set_step("step1", json!({"glassArea": 20}));
        assert_eq!(before.data.field("step1", "glassArea"), Some(&json!(10)));
        assert_eq!(after.data.field("step1", "glassArea"), Some(&json!(20)));
        assert!(after.revision > before.revision);
    }

    #[test]
    fn request_step_enforces_transition_rule() {
        let s = store();
        assert_eq!(s.request_step(1).unwrap().current_step, 1);
        assert_eq!(s.request_step(1).unwrap().current_step, 1);
        let err = s.request_step(3).unwrap_err();
        assert!(matches!(err, FlowError::ValidationRejected(ref m) if m.contains("Invalid step transition")));
        assert_eq!(s.current_step(), 1);
    }

    #[test]
    fn replace_sets_data_and_step() {
        let s = store();
        let data = GuidedFlowData::new().with_step("step2", json!({"notes": "x"}));
        let snap = s.replace(data.clone(), 4);
        assert_eq!(*snap.data, data);
        assert_eq!(s.current_step(), 4);
        assert!(s.does_step_affect_pricing("step1"));
        assert!(!s.does_step_affect_pricing("step2"));
    }
}
