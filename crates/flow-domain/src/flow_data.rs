//! `GuidedFlowData`: payloads opacos por step de una estimación en curso.
//!
//! El mapa está respaldado por un `BTreeMap`, de modo que la serialización es
//! estable (orden de claves determinista) y dos instancias con el mismo
//! contenido producen exactamente los mismos bytes. Los coordinadores nunca
//! mutan una instancia compartida: la UI muta su copia y publica snapshots.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::DomainError;

/// Identificador de step dentro del flujo guiado (p. ej. `"step1"`).
pub type StepId = String;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuidedFlowData {
    steps: BTreeMap<StepId, Value>,
}

impl GuidedFlowData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construye desde un objeto JSON `{ stepId: payload, ... }`.
    ///
    /// # Errores
    /// `DomainError::InvalidFlowData` si el valor no es un objeto.
    pub fn from_value(value: Value) -> Result<Self, DomainError> {
        match value {
            Value::Object(map) => Ok(Self { steps: map.into_iter().collect() }),
            other => Err(DomainError::InvalidFlowData(format!("expected object, found {}", json_kind(&other)))),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.steps.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Variante encadenable de `set_step`, cómoda en tests y demos.
    pub fn with_step(mut self, step_id: impl Into<StepId>, payload: Value) -> Self {
        self.set_step(step_id, payload);
        self
    }

    /// Reemplaza el payload de un step y devuelve el anterior.
    pub fn set_step(&mut self, step_id: impl Into<StepId>, payload: Value) -> Option<Value> {
        self.steps.insert(step_id.into(), payload)
    }

    pub fn remove_step(&mut self, step_id: &str) -> Option<Value> {
        self.steps.remove(step_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id)
    }

    /// Un step cuenta como presente si existe y su payload no es `null`.
    pub fn has_step(&self, step_id: &str) -> bool {
        matches!(self.steps.get(step_id), Some(v) if !v.is_null())
    }

    /// Campo de primer nivel dentro del payload de un step.
    pub fn field(&self, step_id: &str, field: &str) -> Option<&Value> {
        self.steps.get(step_id).and_then(|v| v.get(field)).filter(|v| !v.is_null())
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Fusiona los campos de primer nivel de los steps indicados (en orden;
    /// el último step gana ante claves repetidas). Payloads que no son
    /// objetos se ignoran.
    pub fn merged_fields<'a, I>(&self, step_ids: I) -> Map<String, Value>
        where I: IntoIterator<Item = &'a str>
    {
        let mut merged = Map::new();
        for id in step_ids {
            if let Some(Value::Object(fields)) = self.steps.get(id) {
                for (k, v) in fields {
                    if !v.is_null() {
                        merged.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        merged
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
