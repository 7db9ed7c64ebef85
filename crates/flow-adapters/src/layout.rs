//! Layout de steps del estimador.
use flow_core::{Computation, DependencyGraph, FlowError, StepRole, StepSpec};

pub const STEP_MEASUREMENTS: &str = "step1";
pub const STEP_SERVICES: &str = "step2";
pub const STEP_DETAILS: &str = "step3";
pub const STEP_REVIEW: &str = "step4";

/// `step1` medidas → `step2` servicios → `step3` detalles → `step4` revisión.
/// Todos los servicios de la tabla estándar se cotizan con las medidas de
/// `step1`; sin selección explícita se cotiza limpieza de vidrios.
pub fn standard_graph() -> Result<DependencyGraph, FlowError> {
    DependencyGraph::builder().step(StepSpec::new(STEP_MEASUREMENTS, StepRole::Measurements).feeds(Computation::Pricing)
                                                                                            .feeds(Computation::Validation)
                                                                                            .required_fields(["glassArea",
                                                                                                              "stories"]))
                              .step(StepSpec::new(STEP_SERVICES, StepRole::ServiceSelection).feeds(Computation::Pricing)
                                                                                            .feeds(Computation::Validation)
                                                                                            .depends_on(STEP_MEASUREMENTS))
                              .step(StepSpec::new(STEP_DETAILS, StepRole::Details).feeds(Computation::Validation)
                                                                                  .depends_on(STEP_SERVICES))
                              .step(StepSpec::new(STEP_REVIEW, StepRole::Review).depends_on(STEP_DETAILS))
                              .service_requires("window-cleaning", [STEP_MEASUREMENTS])
                              .service_requires("pressure-washing", [STEP_MEASUREMENTS])
                              .service_requires("gutter-cleaning", [STEP_MEASUREMENTS])
                              .default_services(["window-cleaning"])
                              .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_graph_is_well_formed() {
        let g = standard_graph().unwrap();
        assert_eq!(g.len(), 4);
        assert!(g.does_step_affect_pricing(STEP_MEASUREMENTS));
        assert!(g.does_step_affect_pricing(STEP_SERVICES));
        assert!(!g.does_step_affect_pricing(STEP_DETAILS));
        assert_eq!(g.downstream_of(STEP_MEASUREMENTS), vec![STEP_SERVICES, STEP_DETAILS, STEP_REVIEW]);
        assert_eq!(g.required_steps_for_service("gutter-cleaning"), [STEP_MEASUREMENTS.to_string()]);
    }
}
