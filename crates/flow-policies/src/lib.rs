//! flow-policies – Políticas de confianza
//!
//! Provee el contrato `ConfidencePolicy` y una implementación por umbrales
//! (`ThresholdPolicy`) para etiquetar resultados de precio y validación como
//! `high`/`medium`/`low` de forma determinista. Los umbrales son parámetros,
//! no constantes: cada despliegue puede ajustarlos.

use std::collections::BTreeSet;

use flow_domain::Confidence;
use serde::{Deserialize, Serialize};

/// Insumos para decidir la confianza de un `PricingResult`.
#[derive(Clone, Debug, PartialEq)]
pub struct PricingSignals<'a> {
    /// Campos requeridos ausentes (unión de lo reportado por el oráculo).
    pub missing_data: &'a [String],
    /// Servicios que no pudieron cotizarse por falta de datos.
    pub blocked_services: &'a [String],
    /// `true` si todos los steps de los que dependen los servicios están
    /// presentes.
    pub contributing_steps_complete: bool,
}

/// Insumos para decidir la confianza de un `ValidationResult`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationSignals {
    pub errors: usize,
    pub warnings: usize,
}

/// Contrato de políticas de confianza deterministas.
pub trait ConfidencePolicy: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &'static str;
    fn pricing_confidence(&self, signals: &PricingSignals<'_>) -> Confidence;
    fn validation_confidence(&self, signals: ValidationSignals) -> Confidence;
}

/// Parámetros de `ThresholdPolicy`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ThresholdParams {
    /// Campos cuya ausencia degrada directamente a `low`.
    pub critical_fields: BTreeSet<String>,
    /// Máximo de campos no críticos ausentes tolerados en `medium`.
    pub max_missing_for_medium: usize,
    /// Máximo de avisos de validación tolerados en `medium`.
    pub max_warnings_for_medium: usize,
}

impl Default for ThresholdParams {
    fn default() -> Self {
        Self { critical_fields: ["glassArea".to_string()].into_iter().collect(),
               max_missing_for_medium: 2,
               max_warnings_for_medium: 3 }
    }
}

/// Política por umbrales:
/// - `high`: nada falta y los steps contribuyentes están completos.
/// - `low`: falta un campo crítico, algún servicio quedó bloqueado o se
///   supera `max_missing_for_medium`.
/// - `medium`: el resto.
#[derive(Clone, Debug, Default)]
pub struct ThresholdPolicy {
    params: ThresholdParams,
}

impl ThresholdPolicy {
    pub fn new(params: ThresholdParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ThresholdParams {
        &self.params
    }
}

impl ConfidencePolicy for ThresholdPolicy {
    fn id(&self) -> &'static str {
        "threshold"
    }

    fn pricing_confidence(&self, signals: &PricingSignals<'_>) -> Confidence {
        if !signals.blocked_services.is_empty() {
            return Confidence::Low;
        }
        if signals.missing_data.iter().any(|f| self.params.critical_fields.contains(f)) {
            return Confidence::Low;
        }
        match signals.missing_data.len() {
            0 if signals.contributing_steps_complete => Confidence::High,
            n if n <= self.params.max_missing_for_medium => Confidence::Medium,
            _ => Confidence::Low,
        }
    }

    fn validation_confidence(&self, signals: ValidationSignals) -> Confidence {
        match (signals.errors, signals.warnings) {
            (0, 0) => Confidence::High,
            (0, w) if w <= self.params.max_warnings_for_medium => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals<'a>(missing: &'a [String], blocked: &'a [String], complete: bool) -> PricingSignals<'a> {
        PricingSignals { missing_data: missing,
                         blocked_services: blocked,
                         contributing_steps_complete: complete }
    }

    #[test]
    fn nothing_missing_and_complete_is_high() {
        let p = ThresholdPolicy::default();
        assert_eq!(p.pricing_confidence(&signals(&[], &[], true)), Confidence::High);
        // Sin faltantes pero con steps incompletos no alcanza `high`.
        assert_eq!(p.pricing_confidence(&signals(&[], &[], false)), Confidence::Medium);
    }

    #[test]
    fn non_critical_missing_is_medium_critical_is_low() {
        let p = ThresholdPolicy::default();
        let stories = vec!["stories".to_string()];
        assert_eq!(p.pricing_confidence(&signals(&stories, &[], true)), Confidence::Medium);
        let glass = vec!["glassArea".to_string()];
        assert_eq!(p.pricing_confidence(&signals(&glass, &[], true)), Confidence::Low);
    }

    #[test]
    fn blocked_service_or_too_many_missing_is_low() {
        let p = ThresholdPolicy::new(ThresholdParams { critical_fields: BTreeSet::new(),
                                                       max_missing_for_medium: 1,
                                                       max_warnings_for_medium: 0 });
        let two = vec!["a".to_string(), "b".to_string()];
        assert_eq!(p.pricing_confidence(&signals(&two, &[], true)), Confidence::Low);
        let blocked = vec!["gutter-cleaning".to_string()];
        assert_eq!(p.pricing_confidence(&signals(&[], &blocked, true)), Confidence::Low);
    }

    #[test]
    fn validation_confidence_thresholds() {
        let p = ThresholdPolicy::default();
        assert_eq!(p.validation_confidence(ValidationSignals { errors: 0, warnings: 0 }), Confidence::High);
        assert_eq!(p.validation_confidence(ValidationSignals { errors: 0, warnings: 2 }), Confidence::Medium);
        assert_eq!(p.validation_confidence(ValidationSignals { errors: 1, warnings: 0 }), Confidence::Low);
        assert_eq!(p.validation_confidence(ValidationSignals { errors: 0, warnings: 9 }), Confidence::Low);
    }

    #[test]
    fn params_round_trip_through_json() {
        let params = ThresholdParams::default();
        let v = serde_json::to_value(&params).unwrap();
        let back: ThresholdParams = serde_json::from_value(v).unwrap();
        assert_eq!(back, params);
    }
}
