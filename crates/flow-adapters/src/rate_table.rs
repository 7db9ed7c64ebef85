//! Oráculo de precios por tabla de tarifas.
//!
//! `costo = (base + medida * tarifa) * multiplicador`, donde cada
//! multiplicador suma `per_unit` por unidad por encima de la primera
//! (p. ej. 10% por piso adicional).
//!
//! Sin la medida principal el servicio no se puede cotizar: costo 0 y el
//! campo se reporta faltante. Un multiplicador ausente cuenta como 1 y
//! también se reporta, pero no bloquea el precio.
use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use flow_core::{OracleError, PricingOracle};
use flow_domain::{Measurements, ServiceCost, ServiceSelection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Multiplier {
    pub field: String,
    pub per_unit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateCard {
    pub base: f64,
    pub unit_field: String,
    pub unit_rate: f64,
    #[serde(default)]
    pub multipliers: Vec<Multiplier>,
}

#[derive(Debug, Clone, Default)]
pub struct RateTablePricingOracle {
    cards: BTreeMap<String, RateCard>,
    latency: Option<Duration>,
}

impl RateTablePricingOracle {
    pub fn new(cards: BTreeMap<String, RateCard>) -> Self {
        Self { cards, latency: None }
    }

    /// Tarifas del estimador de limpieza.
    pub fn standard() -> Self {
        let stories = |per_unit| Multiplier { field: "stories".into(),
                                              per_unit };
        let mut cards = BTreeMap::new();
        cards.insert("window-cleaning".to_string(),
                     RateCard { base: 150.0,
                                unit_field: "glassArea".into(),
                                unit_rate: 0.25,
                                multipliers: vec![stories(0.10)] });
        cards.insert("pressure-washing".to_string(),
                     RateCard { base: 120.0,
                                unit_field: "surfaceArea".into(),
                                unit_rate: 0.15,
                                multipliers: vec![] });
        cards.insert("gutter-cleaning".to_string(),
                     RateCard { base: 90.0,
                                unit_field: "linearFeet".into(),
                                unit_rate: 1.10,
                                multipliers: vec![stories(0.15)] });
        Self::new(cards)
    }

    /// Carga tarifas desde JSON `{ "serviceId": RateCard, ... }`.
    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_value(value)?))
    }

    /// Demora artificial por llamada (demos y tests de timeout).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.cards.keys().map(|k| k.as_str())
    }
}

fn positive_number(m: &Measurements, field: &str) -> Option<f64> {
    m.get(field).and_then(|v| v.as_f64()).filter(|n| n.is_finite() && *n > 0.0)
}

#[async_trait]
impl PricingOracle for RateTablePricingOracle {
    async fn compute_service_cost(&self,
                                  selection: &ServiceSelection,
                                  measurements: &Measurements)
                                  -> Result<ServiceCost, OracleError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let card = self.cards
                       .get(&selection.service_id)
                       .ok_or_else(|| OracleError::InvalidInput(format!("unknown service '{}'", selection.service_id)))?;

        let mut missing = Vec::new();
        let Some(units) = positive_number(measurements, &card.unit_field) else {
            missing.push(card.unit_field.clone());
            missing.extend(card.multipliers
                               .iter()
                               .filter(|m| positive_number(measurements, &m.field).is_none())
                               .map(|m| m.field.clone()));
            return Ok(ServiceCost { cost: 0.0,
                                    required_fields_missing: missing });
        };

        let mut factor = 1.0;
        for mult in &card.multipliers {
            match positive_number(measurements, &mult.field) {
                Some(n) => factor += mult.per_unit * (n - 1.0).max(0.0),
                None => missing.push(mult.field.clone()),
            }
        }
        Ok(ServiceCost { cost: (card.base + units * card.unit_rate) * factor,
                         required_fields_missing: missing })
    }
}
