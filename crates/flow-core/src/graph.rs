//! `DependencyGraph`: mapa estático de qué steps alimentan qué cálculos.
//!
//! Los steps se declaran en orden de flujo; un step sólo puede depender de
//! steps declarados antes que él, lo que garantiza un DAG sin necesidad de
//! detección de ciclos. El grafo es inmutable una vez construido y se
//! comparte por `Arc` entre store y coordinadores.
use std::collections::{BTreeMap, BTreeSet, HashMap};

use flow_domain::{GuidedFlowData, ServiceSelection, StepId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::FlowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepRole {
    Measurements,
    ServiceSelection,
    Details,
    Review,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Computation {
    Pricing,
    Validation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepNode {
    pub id: StepId,
    pub index: usize,
    pub role: StepRole,
    pub feeds: BTreeSet<Computation>,
    pub depends_on: Vec<StepId>,
    /// Campos que el step debería traer para una estimación completa.
    pub required_fields: Vec<String>,
}

/// Declaración de un step para el builder.
#[derive(Debug, Clone)]
pub struct StepSpec {
    id: StepId,
    role: StepRole,
    feeds: BTreeSet<Computation>,
    depends_on: Vec<StepId>,
    required_fields: Vec<String>,
}

impl StepSpec {
    pub fn new(id: impl Into<StepId>, role: StepRole) -> Self {
        Self { id: id.into(),
               role,
               feeds: BTreeSet::new(),
               depends_on: vec![],
               required_fields: vec![] }
    }

    pub fn feeds(mut self, computation: Computation) -> Self {
        self.feeds.insert(computation);
        self
    }

    pub fn depends_on(mut self, step: impl Into<StepId>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn required_fields<I, S>(mut self, fields: I) -> Self
        where I: IntoIterator<Item = S>,
              S: Into<String>
    {
        self.required_fields.extend(fields.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraphBuilder {
    steps: Vec<StepSpec>,
    service_requirements: BTreeMap<String, Vec<StepId>>,
    default_services: Vec<String>,
    services_field: Option<String>,
}

impl DependencyGraphBuilder {
    pub fn step(mut self, spec: StepSpec) -> Self {
        self.steps.push(spec);
        self
    }

    /// Declara que `service` necesita los steps indicados para cotizarse.
    pub fn service_requires<I, S>(mut self, service: impl Into<String>, steps: I) -> Self
        where I: IntoIterator<Item = S>,
              S: Into<StepId>
    {
        self.service_requirements
            .entry(service.into())
            .or_default()
            .extend(steps.into_iter().map(Into::into));
        self
    }

    /// Servicios cotizados cuando ningún step de selección trae servicios.
    pub fn default_services<I, S>(mut self, services: I) -> Self
        where I: IntoIterator<Item = S>,
              S: Into<String>
    {
        self.default_services = services.into_iter().map(Into::into).collect();
        self
    }

    /// Nombre del campo que lista servicios dentro de los steps de selección
    /// (por defecto `"services"`).
    pub fn services_field(mut self, field: impl Into<String>) -> Self {
        self.services_field = Some(field.into());
        self
    }

    /// # Errores
    /// `FlowError::Config` ante ids duplicados, dependencias hacia steps
    /// desconocidos o posteriores, o requisitos de servicio sobre steps
    /// inexistentes.
    pub fn build(self) -> Result<DependencyGraph, FlowError> {
        let mut index: HashMap<StepId, usize> = HashMap::new();
        let mut nodes = Vec::with_capacity(self.steps.len());
        for (i, spec) in self.steps.into_iter().enumerate() {
            if index.contains_key(&spec.id) {
                return Err(FlowError::Config(format!("duplicate step id '{}'", spec.id)));
            }
            for dep in &spec.depends_on {
                if !index.contains_key(dep) {
                    return Err(FlowError::Config(format!("step '{}' depends on unknown or later step '{}'",
                                                         spec.id, dep)));
                }
            }
            index.insert(spec.id.clone(), i);
            nodes.push(StepNode { id: spec.id,
                                  index: i,
                                  role: spec.role,
                                  feeds: spec.feeds,
                                  depends_on: spec.depends_on,
                                  required_fields: spec.required_fields });
        }
        for (service, steps) in &self.service_requirements {
            if let Some(unknown) = steps.iter().find(|s| !index.contains_key(*s)) {
                return Err(FlowError::Config(format!("service '{service}' requires unknown step '{unknown}'")));
            }
        }
        Ok(DependencyGraph { nodes,
                             index,
                             service_requirements: self.service_requirements,
                             default_services: self.default_services,
                             services_field: self.services_field.unwrap_or_else(|| "services".to_string()) })
    }
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<StepNode>,
    index: HashMap<StepId, usize>,
    service_requirements: BTreeMap<String, Vec<StepId>>,
    default_services: Vec<String>,
    services_field: String,
}

impl DependencyGraph {
    pub fn builder() -> DependencyGraphBuilder {
        DependencyGraphBuilder::default()
    }

    pub fn nodes(&self) -> &[StepNode] {
        &self.nodes
    }

    pub fn node(&self, step_id: &str) -> Option<&StepNode> {
        self.index.get(step_id).map(|&i| &self.nodes[i])
    }

    /// Step en la posición `index` del flujo (la UI navega por índice).
    pub fn node_at(&self, index: usize) -> Option<&StepNode> {
        self.nodes.get(index)
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.index.contains_key(step_id)
    }

    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.index.get(step_id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.id.as_str())
    }

    /// `true` si el step alimenta el cálculo de precio. Steps desconocidos no
    /// lo afectan.
    pub fn does_step_affect_pricing(&self, step_id: &str) -> bool {
        self.node(step_id).map(|n| n.feeds.contains(&Computation::Pricing)).unwrap_or(false)
    }

    pub fn steps_feeding(&self, computation: Computation) -> impl Iterator<Item = &StepNode> {
        self.nodes.iter().filter(move |n| n.feeds.contains(&computation))
    }

    pub fn steps_with_role(&self, role: StepRole) -> impl Iterator<Item = &StepNode> {
        self.nodes.iter().filter(move |n| n.role == role)
    }

    /// Dependencias directas de un step.
    pub fn upstream_of(&self, step_id: &str) -> &[StepId] {
        self.node(step_id).map(|n| n.depends_on.as_slice()).unwrap_or(&[])
    }

    /// Steps que dependen (transitivamente) de `step_id`, en orden de flujo.
    pub fn downstream_of(&self, step_id: &str) -> Vec<StepId> {
        let Some(&start) = self.index.get(step_id) else { return vec![] };
        let mut reached: BTreeSet<usize> = BTreeSet::new();
        reached.insert(start);
        // Las dependencias sólo apuntan hacia atrás: un barrido hacia adelante
        // alcanza el cierre transitivo.
        for node in &self.nodes[start + 1..] {
            if node.depends_on.iter().any(|d| self.index.get(d).is_some_and(|i| reached.contains(i))) {
                reached.insert(node.index);
            }
        }
        reached.remove(&start);
        reached.into_iter().map(|i| self.nodes[i].id.clone()).collect()
    }

    pub fn required_steps_for_service(&self, service_id: &str) -> &[StepId] {
        self.service_requirements.get(service_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn default_services(&self) -> &[String] {
        &self.default_services
    }

    pub fn services_field(&self) -> &str {
        &self.services_field
    }

    /// Servicios elegidos en los steps de selección. Acepta strings o
    /// objetos `{ "serviceId" | "id": ..., "options": ... }`; sin selección
    /// explícita se usan los servicios por defecto.
    pub fn selected_services(&self, data: &GuidedFlowData) -> Vec<ServiceSelection> {
        let mut selected: Vec<ServiceSelection> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for node in self.steps_with_role(StepRole::ServiceSelection) {
            let Some(Value::Array(items)) = data.field(&node.id, &self.services_field) else { continue };
            for item in items {
                if let Some(sel) = parse_selection(item) {
                    if seen.insert(sel.service_id.clone()) {
                        selected.push(sel);
                    }
                }
            }
        }
        if selected.is_empty() {
            selected = self.default_services.iter().map(ServiceSelection::new).collect();
        }
        selected
    }
}

fn parse_selection(item: &Value) -> Option<ServiceSelection> {
    match item {
        Value::String(id) if !id.is_empty() => Some(ServiceSelection::new(id.clone())),
        Value::Object(map) => {
            let id = map.get("serviceId").or_else(|| map.get("id")).and_then(Value::as_str)?;
            Some(ServiceSelection { service_id: id.to_string(),
                                    options: map.get("options").cloned().unwrap_or(Value::Null) })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph() -> DependencyGraph {
        DependencyGraph::builder().step(StepSpec::new("m", StepRole::Measurements).feeds(Computation::Pricing)
                                                                                 .feeds(Computation::Validation))
                                  .step(StepSpec::new("s", StepRole::ServiceSelection).feeds(Computation::Pricing)
                                                                                      .depends_on("m"))
                                  .step(StepSpec::new("d", StepRole::Details).feeds(Computation::Validation)
                                                                             .depends_on("s"))
                                  .step(StepSpec::new("r", StepRole::Review).depends_on("m"))
                                  .service_requires("wash", ["m"])
                                  .default_services(["wash"])
                                  .build()
                                  .expect("valid graph")
    }

    #[test]
    fn pricing_relevance() {
        let g = graph();
        assert!(g.does_step_affect_pricing("m"));
        assert!(g.does_step_affect_pricing("s"));
        assert!(!g.does_step_affect_pricing("d"));
        assert!(!g.does_step_affect_pricing("unknown"));
    }

    #[test]
    fn downstream_is_transitive_and_ordered() {
        let g = graph();
        assert_eq!(g.downstream_of("m"), vec!["s", "d", "r"]);
        assert_eq!(g.downstream_of("s"), vec!["d"]);
        assert!(g.downstream_of("d").is_empty());
        assert!(g.downstream_of("nope").is_empty());
    }

    #[test]
    fn build_rejects_forward_and_duplicate_dependencies() {
        let fwd = DependencyGraph::builder().step(StepSpec::new("a", StepRole::Details).depends_on("b"))
                                            .step(StepSpec::new("b", StepRole::Details))
                                            .build();
        assert!(matches!(fwd, Err(FlowError::Config(_))));
        let dup = DependencyGraph::builder().step(StepSpec::new("a", StepRole::Details))
                                            .step(StepSpec::new("a", StepRole::Review))
                                            .build();
        assert!(matches!(dup, Err(FlowError::Config(_))));
        let svc = DependencyGraph::builder().step(StepSpec::new("a", StepRole::Details))
                                            .service_requires("x", ["zzz"])
                                            .build();
        assert!(matches!(svc, Err(FlowError::Config(_))));
    }

    #[test]
    fn selected_services_parses_strings_objects_and_defaults() {
        let g = graph();
        let none = GuidedFlowData::new();
        assert_eq!(g.selected_services(&none), vec![ServiceSelection::new("wash")]);

        let data = GuidedFlowData::new().with_step("s",
                                                   json!({"services": ["paint", {"serviceId": "wash", "options": {"x": 1}}, "paint", 4]}));
        let sel = g.selected_services(&data);
        assert_eq!(sel.len(), 2);
        assert_eq!(sel[0].service_id, "paint");
        assert_eq!(sel[1].options, json!({"x": 1}));
    }
}
