//! Pricing: cálculo de `PricingResult` y su coordinador con debounce.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flow_domain::{GuidedFlowData, PricingResult, ServiceCost, ServiceLineItem, StepId};
use flow_policies::{ConfidencePolicy, PricingSignals};
use futures::future::join_all;
use indexmap::IndexSet;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::coordinator::{KeyedCoordinator, Recompute, RecomputeRequest, UpdateOutcome};
use crate::errors::FlowError;
use crate::graph::{Computation, DependencyGraph, StepRole};
use crate::hub::Subscription;
use crate::oracle::PricingOracle;

/// Campo reportado como faltante cuando no hay servicios que cotizar.
pub const SERVICES_MISSING: &str = "services";

#[derive(Debug)]
pub struct PricingEngine {
    oracle: Arc<dyn PricingOracle>,
    graph: Arc<DependencyGraph>,
    policy: Arc<dyn ConfidencePolicy>,
    clock: Arc<dyn Clock>,
    oracle_timeout: Duration,
}

impl PricingEngine {
    pub fn new(oracle: Arc<dyn PricingOracle>,
               graph: Arc<DependencyGraph>,
               policy: Arc<dyn ConfidencePolicy>,
               clock: Arc<dyn Clock>,
               oracle_timeout: Duration)
               -> Self {
        Self { oracle,
               graph,
               policy,
               clock,
               oracle_timeout }
    }

    /// Cotiza todos los servicios seleccionados.
    ///
    /// # Errores
    /// `FlowError::OracleUnavailable` si alguna llamada al oráculo falla o
    /// excede `oracle_timeout`. Nunca se devuelve un resultado parcial.
    pub async fn price(&self, data: &GuidedFlowData) -> Result<PricingResult, FlowError> {
        let measurement_steps: Vec<&str> = self.graph
                                               .steps_feeding(Computation::Pricing)
                                               .filter(|n| n.role == StepRole::Measurements)
                                               .map(|n| n.id.as_str())
                                               .collect();
        let measurements = data.merged_fields(measurement_steps.iter().copied());
        let services = self.graph.selected_services(data);
        let source_steps_used: Vec<StepId> = self.graph
                                                 .steps_feeding(Computation::Pricing)
                                                 .filter(|n| data.has_step(&n.id))
                                                 .map(|n| n.id.clone())
                                                 .collect();

        if services.is_empty() {
            return Ok(PricingResult { total_cost: 0.0,
                                      service_breakdown: vec![],
                                      confidence: flow_domain::Confidence::Low,
                                      missing_data: vec![SERVICES_MISSING.to_string()],
                                      computed_at: self.clock.now(),
                                      source_steps_used });
        }

        let calls = services.iter().map(|sel| {
                                       let measurements = &measurements;
                                       async move {
                                           tokio::time::timeout(self.oracle_timeout,
                                                                self.oracle.compute_service_cost(sel, measurements)).await
                                       }
                                   });
        let replies = join_all(calls).await;

        let mut breakdown = Vec::with_capacity(services.len());
        let mut missing: IndexSet<String> = IndexSet::new();
        let mut blocked: Vec<String> = Vec::new();
        for (sel, reply) in services.iter().zip(replies) {
            let ServiceCost { cost, required_fields_missing } = match reply {
                Ok(Ok(c)) => c,
                Ok(Err(e)) => {
                    warn!("pricing:oracle:failed service={} err={}", sel.service_id, e);
                    return Err(FlowError::OracleUnavailable(format!("{}: {e}", sel.service_id)));
                }
                Err(_) => {
                    warn!("pricing:oracle:timeout service={} timeout_ms={}",
                          sel.service_id,
                          self.oracle_timeout.as_millis());
                    return Err(FlowError::OracleUnavailable(format!("{}: timed out after {}ms",
                                                                    sel.service_id,
                                                                    self.oracle_timeout.as_millis())));
                }
            };
            if cost <= 0.0 && !required_fields_missing.is_empty() {
                blocked.push(sel.service_id.clone());
            }
            missing.extend(required_fields_missing.iter().cloned());
            breakdown.push(ServiceLineItem { service_id: sel.service_id.clone(),
                                             cost: round_cents(cost.max(0.0)),
                                             missing_fields: required_fields_missing });
        }

        let contributing_steps_complete = services.iter()
                                                  .flat_map(|s| self.graph.required_steps_for_service(&s.service_id))
                                                  .map(|s| s.as_str())
                                                  .chain(measurement_steps.iter().copied())
                                                  .all(|s| data.has_step(s));
        let missing_data: Vec<String> = missing.into_iter().collect();
        let confidence = self.policy.pricing_confidence(&PricingSignals { missing_data: &missing_data,
                                                                          blocked_services: &blocked,
                                                                          contributing_steps_complete });
        let total_cost = round_cents(breakdown.iter().map(|l| l.cost).sum());
        debug!("pricing:computed total={} services={} missing={} confidence={:?}",
               total_cost,
               breakdown.len(),
               missing_data.len(),
               confidence);
        Ok(PricingResult { total_cost,
                           service_breakdown: breakdown,
                           confidence,
                           missing_data,
                           computed_at: self.clock.now(),
                           source_steps_used })
    }
}

fn round_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[async_trait]
impl Recompute for PricingEngine {
    type Output = PricingResult;
    const NAME: &'static str = "pricing";

    async fn compute(&self, request: &RecomputeRequest) -> Result<PricingResult, FlowError> {
        self.price(&request.data).await
    }

    fn stamp(output: &PricingResult) -> DateTime<Utc> {
        output.computed_at
    }

    fn restamp(output: &mut PricingResult, at: DateTime<Utc>) {
        output.computed_at = at;
    }
}

/// Recalcula precios con debounce y publica a los suscriptores de cada
/// `estimate_id`.
#[derive(Clone)]
pub struct PricingCoordinator {
    inner: KeyedCoordinator<PricingEngine>,
    graph: Arc<DependencyGraph>,
}

impl PricingCoordinator {
    pub fn new(engine: PricingEngine, debounce: Duration) -> Self {
        let graph = Arc::clone(&engine.graph);
        Self { inner: KeyedCoordinator::new(engine, debounce),
               graph }
    }

    pub fn subscribe<F>(&self, estimate_id: &str, callback: F) -> Subscription
        where F: Fn(&PricingResult) + Send + Sync + 'static
    {
        self.inner.subscribe(estimate_id, callback)
    }

    pub fn channel(&self, estimate_id: &str) -> (Subscription, mpsc::UnboundedReceiver<PricingResult>) {
        self.inner.channel(estimate_id)
    }

    /// Programa (o ejecuta, con `immediate`) un recálculo. Un cambio en un
    /// step que no alimenta el precio se ignora salvo que sea inmediato.
    pub async fn update_pricing(&self,
                                data: impl Into<Arc<GuidedFlowData>>,
                                estimate_id: &str,
                                changed_step: Option<&str>,
                                immediate: bool)
                                -> Result<UpdateOutcome<PricingResult>, FlowError> {
        if let Some(step) = changed_step {
            if !immediate && !self.graph.does_step_affect_pricing(step) {
                debug!("pricing:update:irrelevant_step estimate_id={estimate_id} step={step}");
                return Ok(UpdateOutcome::Skipped);
            }
        }
        self.inner.update(data.into(), estimate_id, changed_step, immediate).await
    }

    /// Recálculo inmediato que devuelve el resultado vigente.
    pub async fn recalculate(&self,
                             data: impl Into<Arc<GuidedFlowData>>,
                             estimate_id: &str)
                             -> Result<Arc<PricingResult>, FlowError> {
        match self.inner.update(data.into(), estimate_id, None, true).await? {
            UpdateOutcome::Published(result) => Ok(result),
            _ => self.latest(estimate_id)
                     .ok_or_else(|| FlowError::Internal(format!("pricing for {estimate_id} was superseded"))),
        }
    }

    /// Cálculo sin debounce ni publicación.
    pub async fn calculate_real_time_pricing(&self,
                                             data: impl Into<Arc<GuidedFlowData>>,
                                             estimate_id: &str)
                                             -> Result<PricingResult, FlowError> {
        self.inner.compute_now(data.into(), estimate_id).await
    }

    pub fn latest(&self, estimate_id: &str) -> Option<Arc<PricingResult>> {
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

impl std::fmt::Debug for PricingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PricingCoordinator").field("engine", self.inner.engine()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::graph::StepSpec;
    use crate::oracle::OracleError;
    use flow_domain::{Confidence, Measurements, ServiceSelection};
    use flow_policies::ThresholdPolicy;
    use serde_json::json;

    /// Cobra `rate * area`; reporta `area` si falta y `stories` como no
    /// crítico.
    #[derive(Debug)]
    struct AreaOracle {
        delay: Duration,
    }

    #[async_trait]
    impl PricingOracle for AreaOracle {
        async fn compute_service_cost(&self,
                                      selection: &ServiceSelection,
                                      m: &Measurements)
                                      -> Result<ServiceCost, OracleError> {
            tokio::time::sleep(self.delay).await;
            if selection.service_id == "broken" {
                return Err(OracleError::Unavailable("boom".into()));
            }
            let mut missing = vec![];
            let area = m.get("glassArea").and_then(|v| v.as_f64());
            if area.is_none() {
                missing.push("glassArea".to_string());
            }
            if !m.contains_key("stories") {
                missing.push("stories".to_string());
            }
            Ok(ServiceCost { cost: area.map(|a| a * 0.25 + 100.0).unwrap_or(0.0),
                             required_fields_missing: missing })
        }
    }

    fn engine(delay_ms: u64, timeout_ms: u64, default_service: &str) -> PricingEngine {
        let graph = DependencyGraph::builder().step(StepSpec::new("step1", StepRole::Measurements).feeds(Computation::Pricing))
                                              .step(StepSpec::new("step2", StepRole::ServiceSelection).feeds(Computation::Pricing)
                                                                                                      .depends_on("step1"))
                                              .step(StepSpec::new("step3", StepRole::Details).depends_on("step2"))
                                              .service_requires("wash", ["step1"])
                                              .default_services([default_service])
                                              .build()
                                              .unwrap();
        PricingEngine::new(Arc::new(AreaOracle { delay: Duration::from_millis(delay_ms) }),
                           Arc::new(graph),
                           Arc::new(ThresholdPolicy::default()),
                           Arc::new(ManualClock::default()),
                           Duration::from_millis(timeout_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn complete_measurements_give_high_confidence() {
        let e = engine(0, 1_000, "wash");
        let data = GuidedFlowData::new().with_step("step1", json!({"glassArea": 5000, "stories": 10}));
        let r = e.price(&data).await.unwrap();
        assert_eq!(r.total_cost, 1350.0);
        assert!(r.missing_data.is_empty());
        assert_eq!(r.confidence, Confidence::High);
        assert_eq!(r.source_steps_used, vec!["step1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_fields_downgrade_confidence() {
        let e = engine(0, 1_000, "wash");
        let no_stories = GuidedFlowData::new().with_step("step1", json!({"glassArea": 5000}));
        let r = e.price(&no_stories).await.unwrap();
        assert_eq!(r.missing_data, vec!["stories"]);
        assert_eq!(r.confidence, Confidence::Medium);

        let nothing = GuidedFlowData::new();
        let r = e.price(&nothing).await.unwrap();
        assert_eq!(r.missing_data, vec!["glassArea", "stories"]);
        assert_eq!(r.total_cost, 0.0);
        assert_eq!(r.confidence, Confidence::Low);
    }

    #[tokio::test(start_paused = true)]
    async fn selection_step_overrides_defaults_and_dedupes_missing() {
        let e = engine(0, 1_000, "wash");
        let data = GuidedFlowData::new().with_step("step1", json!({"glassArea": 100}))
                                        .with_step("step2", json!({"services": ["wash", "rinse"]}));
        let r = e.price(&data).await.unwrap();
        assert_eq!(r.service_breakdown.len(), 2);
        assert_eq!(r.missing_data, vec!["stories"]);
        assert_eq!(r.total_cost, 250.0);
        assert_eq!(r.source_steps_used, vec!["step1", "step2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn oracle_failure_and_timeout_are_unavailable() {
        let broken = engine(0, 1_000, "broken");
        let data = GuidedFlowData::new().with_step("step1", json!({"glassArea": 1}));
        assert!(matches!(broken.price(&data).await, Err(FlowError::OracleUnavailable(_))));

        let slow = engine(5_000, 100, "wash");
        let err = slow.price(&data).await.unwrap_err();
        assert!(matches!(err, FlowError::OracleUnavailable(ref m) if m.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn irrelevant_step_does_not_schedule() {
        let c = PricingCoordinator::new(engine(0, 1_000, "wash"), Duration::from_millis(100));
        let data = GuidedFlowData::new().with_step("step3", json!({"notes": "n"}));
        assert_eq!(c.update_pricing(data.clone(), "e1", Some("step3"), false).await.unwrap(),
                   UpdateOutcome::Skipped);
        assert!(!c.is_pending("e1"));
        let r = c.recalculate(data, "e1").await.unwrap();
        assert_eq!(c.latest("e1").unwrap(), r);
    }

    #[tokio::test(start_paused = true)]
    async fn real_time_pricing_does_not_publish() {
        let c = PricingCoordinator::new(engine(0, 1_000, "wash"), Duration::from_millis(100));
        let (_sub, mut rx) = c.channel("e1");
        let data = GuidedFlowData::new().with_step("step1", json!({"glassArea": 5000, "stories": 1}));
        let r = c.calculate_real_time_pricing(data, "e1").await.unwrap();
        assert!(r.total_cost > 0.0);
        assert!(c.latest("e1").is_none());
        assert!(rx.try_recv().is_err());
    }
}
