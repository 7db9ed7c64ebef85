//! Builder para `GuidedFlowEngine`.
//!
//! `EngineBuilderInit` exige lo que no tiene valor por defecto (sesión y
//! grafo); `oracle` lo convierte en `EngineBuilder`, donde el resto de los
//! colaboradores es opcional:
//!
//! ```ignore
//! let engine = GuidedFlowEngine::builder(session, graph)
//!     .oracle(oracle)
//!     .draft_store(store)
//!     .config(config)
//!     .build()?;
//! ```
use std::sync::Arc;

use flow_domain::SessionContext;
use flow_policies::{ConfidencePolicy, ThresholdPolicy};

use crate::autosave::AutoSaveCoordinator;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::engine::GuidedFlowEngine;
use crate::errors::FlowError;
use crate::graph::DependencyGraph;
use crate::oracle::PricingOracle;
use crate::pricing::{PricingCoordinator, PricingEngine};
use crate::recovery::RecoveryManager;
use crate::repo::{DraftStore, InMemoryDraftStore};
use crate::store::FlowDataStore;
use crate::validation::{ValidationCoordinator, ValidationEngine};

#[derive(Debug)]
pub struct EngineBuilderInit {
    session: SessionContext,
    graph: Arc<DependencyGraph>,
}

impl EngineBuilderInit {
    pub(crate) fn new(session: SessionContext, graph: Arc<DependencyGraph>) -> Self {
        Self { session, graph }
    }

    pub fn oracle(self, oracle: Arc<dyn PricingOracle>) -> EngineBuilder {
        EngineBuilder { session: self.session,
                        graph: self.graph,
                        oracle,
                        draft_store: None,
                        policy: None,
                        clock: None,
                        config: EngineConfig::default() }
    }
}

#[derive(Debug)]
pub struct EngineBuilder {
    session: SessionContext,
    graph: Arc<DependencyGraph>,
    oracle: Arc<dyn PricingOracle>,
    draft_store: Option<Arc<dyn DraftStore>>,
    policy: Option<Arc<dyn ConfidencePolicy>>,
    clock: Option<Arc<dyn Clock>>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Por defecto `InMemoryDraftStore`.
    pub fn draft_store(mut self, store: Arc<dyn DraftStore>) -> Self {
        self.draft_store = Some(store);
        self
    }

    /// Por defecto `ThresholdPolicy::default()`.
    pub fn policy(mut self, policy: Arc<dyn ConfidencePolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// # Errores
    /// `FlowError::Config` si el grafo está vacío o algún timeout es cero.
    pub fn build(self) -> Result<GuidedFlowEngine, FlowError> {
        if self.graph.is_empty() {
            return Err(FlowError::Config("dependency graph has no steps".into()));
        }
        if self.config.oracle_timeout.is_zero() || self.config.store_timeout.is_zero() {
            return Err(FlowError::Config("oracle and store timeouts must be greater than zero".into()));
        }
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let policy: Arc<dyn ConfidencePolicy> = self.policy.unwrap_or_else(|| Arc::new(ThresholdPolicy::default()));
        let draft_store: Arc<dyn DraftStore> =
            self.draft_store.unwrap_or_else(|| Arc::new(InMemoryDraftStore::new(Arc::clone(&clock))));

        let store = FlowDataStore::new(Arc::clone(&self.graph));
        let pricing = PricingCoordinator::new(PricingEngine::new(self.oracle,
                                                                 Arc::clone(&self.graph),
                                                                 Arc::clone(&policy),
                                                                 Arc::clone(&clock),
                                                                 self.config.oracle_timeout),
                                              self.config.pricing_debounce);
        let validation =
            ValidationCoordinator::new(ValidationEngine::new(Arc::clone(&self.graph), policy, Arc::clone(&clock)),
                                       self.config.validation_debounce);
        let autosave = AutoSaveCoordinator::new(self.session.clone(),
                                                Arc::clone(&draft_store),
                                                Arc::clone(&clock),
                                                self.config.autosave_interval,
                                                self.config.store_timeout);
        let recovery = RecoveryManager::new(self.session.clone(),
                                            draft_store,
                                            store.clone(),
                                            clock,
                                            self.config.store_timeout);
        Ok(GuidedFlowEngine::from_parts(self.session,
                                        self.config,
                                        store,
                                        pricing,
                                        validation,
                                        autosave,
                                        recovery))
    }
}
