use std::sync::Arc;

use flow_domain::{PricingResult, SessionContext, SessionDraft, ValidationResult};
use log::{debug, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::autosave::{AutoSaveCoordinator, SaveReceipt};
use crate::config::EngineConfig;
use crate::coordinator::UpdateOutcome;
use crate::engine::EngineBuilderInit;
use crate::errors::FlowError;
use crate::graph::DependencyGraph;
use crate::pricing::PricingCoordinator;
use crate::recovery::{RecoveryManager, RecoveryOptions, RecoveryState};
use crate::store::{FlowDataStore, FlowSnapshot};
use crate::validation::ValidationCoordinator;

/// Una sesión de flujo guiado con todos sus coordinadores.
#[derive(Debug)]
pub struct GuidedFlowEngine {
    session: SessionContext,
    config: EngineConfig,
    store: FlowDataStore,
    pricing: PricingCoordinator,
    validation: ValidationCoordinator,
    autosave: AutoSaveCoordinator,
    recovery: RecoveryManager,
}

impl GuidedFlowEngine {
    pub fn builder(session: SessionContext, graph: Arc<DependencyGraph>) -> EngineBuilderInit {
        EngineBuilderInit::new(session, graph)
    }

    pub(crate) fn from_parts(session: SessionContext,
                             config: EngineConfig,
                             store: FlowDataStore,
                             pricing: PricingCoordinator,
                             validation: ValidationCoordinator,
                             autosave: AutoSaveCoordinator,
                             recovery: RecoveryManager)
                             -> Self {
        Self { session,
               config,
               store,
               pricing,
               validation,
               autosave,
               recovery }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn estimate_id(&self) -> &str {
        &self.session.estimate_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &FlowDataStore {
        &self.store
    }

    pub fn pricing(&self) -> &PricingCoordinator {
        &self.pricing
    }

    pub fn validation(&self) -> &ValidationCoordinator {
        &self.validation
    }

    pub fn autosave(&self) -> &AutoSaveCoordinator {
        &self.autosave
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    /// Busca borradores recuperables al arrancar.
    pub async fn start(&self, options: RecoveryOptions) -> Result<RecoveryState, FlowError> {
        self.recovery.initialize(options).await
    }

    /// Edición desde la UI: actualiza el store y avisa a pricing, validación
    /// y autosave. Los recálculos quedan con debounce.
    ///
    /// # Errores
    /// `FlowError::ValidationRejected` si el step no pertenece al flujo.
    pub async fn edit_step(&self, step_id: &str, payload: Value) -> Result<FlowSnapshot, FlowError> {
        if !self.store.graph().contains(step_id) {
            return Err(FlowError::ValidationRejected(format!("Unknown step '{step_id}'")));
        }
        let snap = self.store.set_step(step_id, payload);
        let estimate_id = self.estimate_id();
        self.pricing
            .update_pricing(Arc::clone(&snap.data), estimate_id, Some(step_id), false)
            .await?;
        self.validation
            .update_validation(Arc::clone(&snap.data), estimate_id, Some(step_id), false)
            .await?;
        self.autosave.set_current_session((*snap.data).clone(), snap.current_step);
        debug!("engine:edit_step estimate_id={} step={} revision={}", estimate_id, step_id, snap.revision);
        Ok(snap)
    }

    /// Navega a otro step. Además de la regla de transición, no se puede
    /// avanzar desde un step bloqueado por la validación.
    pub fn go_to_step(&self, requested: usize) -> Result<FlowSnapshot, FlowError> {
        let current = self.store.snapshot();
        if requested > current.current_step {
            if let Some(node) = self.store.graph().node_at(current.current_step) {
                let result = self.validation.validate_cross_step_data(&current.data, None);
                if result.is_blocked(&node.id) {
                    return Err(FlowError::ValidationRejected(format!("Step '{}' is blocked by validation errors",
                                                                     node.id)));
                }
            }
        }
        let snap = self.store.request_step(requested)?;
        self.autosave.set_current_session((*snap.data).clone(), snap.current_step);
        Ok(snap)
    }

    /// Recalcula precio y validación de inmediato.
    pub async fn recalculate(&self) -> Result<(Arc<PricingResult>, Arc<ValidationResult>), FlowError> {
        let snap = self.store.snapshot();
        let pricing = self.pricing.recalculate(Arc::clone(&snap.data), self.estimate_id()).await?;
        let validation = match self.validation
                                   .update_validation(snap.data, self.estimate_id(), None, true)
                                   .await?
        {
            UpdateOutcome::Published(v) => v,
            _ => self.validation
                     .latest(self.estimate_id())
                     .ok_or_else(|| FlowError::Internal("validation was superseded".into()))?,
        };
        Ok((pricing, validation))
    }

    /// Acepta la recuperación de un borrador: lo carga, recalcula, lo
    /// persiste de inmediato bajo el borrador de esta sesión y recién
    /// entonces borra el original.
    ///
    /// # Errores
    /// `FlowError::SaveFailed` si no se pudo persistir el estado recuperado.
    /// Los datos quedan cargados, la sesión sucia y el original intacto; el
    /// commit se reintenta en `save_and_exit`.
    pub async fn recover(&self, draft_id: Uuid) -> Result<Option<SessionDraft>, FlowError> {
        let Some(draft) = self.recovery.recover_session(draft_id).await? else { return Ok(None) };
        let snap = self.store.snapshot();
        if let Err(e) = self.pricing
                            .update_pricing(Arc::clone(&snap.data), self.estimate_id(), None, true)
                            .await
        {
            // El borrador ya está cargado; el error queda en `last_error`.
            warn!("engine:recover:pricing_failed estimate_id={} err={}", self.estimate_id(), e);
        }
        self.validation
            .update_validation(Arc::clone(&snap.data), self.estimate_id(), None, true)
            .await?;
        self.autosave
            .save_draft((*snap.data).clone(), snap.current_step, true)
            .await?;
        self.finish_recovery().await;
        Ok(Some(draft))
    }

    async fn finish_recovery(&self) {
        match self.recovery.commit_recovery().await {
            Ok(_) => self.recovery.acknowledge(),
            Err(e) => warn!("engine:recover:commit_failed estimate_id={} err={}", self.estimate_id(), e),
        }
    }

    pub async fn decline_recovery(&self) -> Result<usize, FlowError> {
        self.recovery.decline_recovery().await
    }

    /// Guardado final antes de abandonar la sesión; detiene los recálculos
    /// pendientes.
    pub async fn save_and_exit(&self) -> Result<SaveReceipt, FlowError> {
        let snap = self.store.snapshot();
        let receipt = self.autosave.save_and_exit((*snap.data).clone(), snap.current_step).await?;
        if self.recovery.state().pending_commit.is_some() {
            self.finish_recovery().await;
        }
        self.pricing.shutdown();
        self.validation.shutdown();
        Ok(receipt)
    }

    pub fn shutdown(&self) {
        self.pricing.shutdown();
        self.validation.shutdown();
        self.autosave.shutdown();
    }
}
