//! Configuración de tiempos del motor.
use std::time::Duration;

use crate::constants::{DEFAULT_AUTOSAVE_INTERVAL_MS, DEFAULT_ORACLE_TIMEOUT_MS, DEFAULT_PRICING_DEBOUNCE_MS,
                       DEFAULT_STORE_TIMEOUT_MS, DEFAULT_VALIDATION_DEBOUNCE_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub pricing_debounce: Duration,
    pub validation_debounce: Duration,
    pub autosave_interval: Duration,
    /// Una llamada al oráculo que excede este límite se trata como
    /// `OracleUnavailable`.
    pub oracle_timeout: Duration,
    /// Una llamada al store que excede este límite se trata como fallo.
    pub store_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { pricing_debounce: Duration::from_millis(DEFAULT_PRICING_DEBOUNCE_MS),
               validation_debounce: Duration::from_millis(DEFAULT_VALIDATION_DEBOUNCE_MS),
               autosave_interval: Duration::from_millis(DEFAULT_AUTOSAVE_INTERVAL_MS),
               oracle_timeout: Duration::from_millis(DEFAULT_ORACLE_TIMEOUT_MS),
               store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS) }
    }
}

impl EngineConfig {
    pub fn with_pricing_debounce(mut self, d: Duration) -> Self {
        self.pricing_debounce = d;
        self
    }

    pub fn with_validation_debounce(mut self, d: Duration) -> Self {
        self.validation_debounce = d;
        self
    }

    pub fn with_autosave_interval(mut self, d: Duration) -> Self {
        self.autosave_interval = d;
        self
    }

    pub fn with_oracle_timeout(mut self, d: Duration) -> Self {
        self.oracle_timeout = d;
        self
    }

    pub fn with_store_timeout(mut self, d: Duration) -> Self {
        self.store_timeout = d;
        self
    }
}
