//! Validación cruzada entre steps y su coordinador.
//!
//! Reglas:
//! - Un step presente cuya dependencia falta queda bloqueado (error).
//! - Un servicio seleccionado sin su step requerido bloquea la selección.
//! - Un campo requerido ausente es un aviso con sugerencia; no bloquea.
//! - Cambiar un step con steps posteriores ya completados produce un
//!   `ValidationWarning` con los steps afectados; tampoco bloquea.
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flow_domain::{GuidedFlowData, Severity, StepId, ValidationError, ValidationResult, ValidationWarning};
use flow_policies::{ConfidencePolicy, ValidationSignals};
use log::debug;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::coordinator::{KeyedCoordinator, Recompute, RecomputeRequest, UpdateOutcome};
use crate::errors::FlowError;
use crate::graph::{Computation, DependencyGraph, StepRole};
use crate::hub::Subscription;

/// Regla de transición: sólo se puede quedar, avanzar o retroceder un step.
///
/// # Errores
/// `FlowError::ValidationRejected` si `|requested - current| > 1`.
pub fn check_step_transition(current: usize, requested: usize) -> Result<(), FlowError> {
    if current.abs_diff(requested) > 1 {
        return Err(FlowError::ValidationRejected(format!("Invalid step transition from {current} to {requested}")));
    }
    Ok(())
}

#[derive(Debug)]
pub struct ValidationEngine {
    graph: Arc<DependencyGraph>,
    policy: Arc<dyn ConfidencePolicy>,
    clock: Arc<dyn Clock>,
}

impl ValidationEngine {
    pub fn new(graph: Arc<DependencyGraph>, policy: Arc<dyn ConfidencePolicy>, clock: Arc<dyn Clock>) -> Self {
        Self { graph, policy, clock }
    }

    pub fn validate(&self, data: &GuidedFlowData, changed_steps: &BTreeSet<StepId>) -> ValidationResult {
        let mut errors: Vec<ValidationError> = Vec::new();
        let mut warnings: Vec<ValidationWarning> = Vec::new();
        let mut suggestions: Vec<String> = Vec::new();
        let mut blocked: BTreeSet<usize> = BTreeSet::new();

        for node in self.graph.nodes() {
            if !data.has_step(&node.id) {
                continue;
            }
            for dep in &node.depends_on {
                if !data.has_step(dep) {
                    errors.push(ValidationError { step_id: node.id.clone(),
                                                  field: dep.clone(),
                                                  message: format!("Step '{}' requires step '{}' to be completed first",
                                                                   node.id, dep),
                                                  severity: Severity::Error });
                    blocked.insert(node.index);
                }
            }
            for field in &node.required_fields {
                if data.field(&node.id, field).is_none() {
                    errors.push(ValidationError { step_id: node.id.clone(),
                                                  field: field.clone(),
                                                  message: format!("Field '{field}' is required for an accurate estimate"),
                                                  severity: Severity::Warning });
                    suggestions.push(format!("Provide '{field}' in step '{}'", node.id));
                }
            }
        }

        let selection_step = self.graph
                                 .steps_with_role(StepRole::ServiceSelection)
                                 .find(|n| data.has_step(&n.id));
        if let Some(sel_node) = selection_step {
            for service in self.graph.selected_services(data) {
                for required in self.graph.required_steps_for_service(&service.service_id) {
                    if !data.has_step(required) {
                        errors.push(ValidationError { step_id: sel_node.id.clone(),
                                                      field: self.graph.services_field().to_string(),
                                                      message: format!("Service '{}' requires step '{}'",
                                                                       service.service_id, required),
                                                      severity: Severity::Error });
                        blocked.insert(sel_node.index);
                    }
                }
            }
        }

        for changed in changed_steps {
            let affected: Vec<StepId> = self.graph
                                            .downstream_of(changed)
                                            .into_iter()
                                            .filter(|s| data.has_step(s))
                                            .collect();
            if !affected.is_empty() {
                warnings.push(ValidationWarning { message: format!("Changes to step '{changed}' may invalidate later steps"),
                                                  affected_steps: affected });
            }
        }

        for node in self.graph.steps_feeding(Computation::Pricing) {
            if !data.has_step(&node.id) {
                suggestions.push(format!("Complete step '{}' to improve pricing accuracy", node.id));
            }
        }

        let hard = errors.iter().filter(|e| e.severity == Severity::Error).count();
        let soft = errors.len() - hard + warnings.len();
        let confidence = self.policy.validation_confidence(ValidationSignals { errors: hard,
                                                                               warnings: soft });
        let blocked_steps: Vec<StepId> = blocked.into_iter()
                                                .filter_map(|i| self.graph.node_at(i))
                                                .map(|n| n.id.clone())
                                                .collect();
        debug!("validation:computed errors={} warnings={} blocked={:?}", hard, soft, blocked_steps);
        ValidationResult { errors,
                           warnings,
                           suggestions,
                           blocked_steps,
                           confidence,
                           last_validated: self.clock.now() }
    }
}

#[async_trait]
impl Recompute for ValidationEngine {
    type Output = ValidationResult;
    const NAME: &'static str = "validation";

    async fn compute(&self, request: &RecomputeRequest) -> Result<ValidationResult, FlowError> {
        Ok(self.validate(&request.data, &request.changed_steps))
    }

    fn stamp(output: &ValidationResult) -> DateTime<Utc> {
        output.last_validated
    }

    fn restamp(output: &mut ValidationResult, at: DateTime<Utc>) {
        output.last_validated = at;
    }
}

#[derive(Clone)]
pub struct ValidationCoordinator {
    inner: KeyedCoordinator<ValidationEngine>,
}

impl ValidationCoordinator {
    pub fn new(engine: ValidationEngine, debounce: Duration) -> Self {
        Self { inner: KeyedCoordinator::new(engine, debounce) }
    }

    pub fn subscribe<F>(&self, estimate_id: &str, callback: F) -> Subscription
        where F: Fn(&ValidationResult) + Send + Sync + 'static
    {
        self.inner.subscribe(estimate_id, callback)
    }

    pub fn channel(&self, estimate_id: &str) -> (Subscription, mpsc::UnboundedReceiver<ValidationResult>) {
        self.inner.channel(estimate_id)
    }

    pub async fn update_validation(&self,
                                   data: impl Into<Arc<GuidedFlowData>>,
                                   estimate_id: &str,
                                   changed_step: Option<&str>,
                                   immediate: bool)
                                   -> Result<UpdateOutcome<ValidationResult>, FlowError> {
        self.inner.update(data.into(), estimate_id, changed_step, immediate).await
    }

    /// Validación síncrona, sin debounce ni publicación.
    pub fn validate_cross_step_data(&self, data: &GuidedFlowData, changed_step: Option<&str>) -> ValidationResult {
        let changed: BTreeSet<StepId> = changed_step.map(str::to_string).into_iter().collect();
        self.inner.engine().validate(data, &changed)
    }

    pub fn validate_step_transition(&self, current: usize, requested: usize) -> Result<(), FlowError> {
        check_step_transition(current, requested)
    }

    pub fn latest(&self, estimate_id: &str) -> Option<Arc<ValidationResult>> {
        self.inner.latest(estimate_id)
    }

    pub fn last_error(&self, estimate_id: &str) -> Option<FlowError> {
        self.inner.last_error(estimate_id)
    }

    pub fn is_pending(&self, estimate_id: &str) -> bool {
        self.inner.is_pending(estimate_id)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for ValidationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationCoordinator").field("engine", self.inner.engine()).finish()
    }
}
