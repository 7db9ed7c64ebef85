//! Configuración central de la aplicación.
//! Carga variables de entorno (.env) y expone una estructura inmutable
//! (`CONFIG`) con los tiempos del motor y los umbrales de confianza.
//!
//! Variables (todas opcionales; valores inválidos caen al default):
//! - `GUIDEDFLOW_PRICING_DEBOUNCE_MS`, `GUIDEDFLOW_VALIDATION_DEBOUNCE_MS`
//! - `GUIDEDFLOW_AUTOSAVE_INTERVAL_MS`
//! - `GUIDEDFLOW_ORACLE_TIMEOUT_MS`, `GUIDEDFLOW_STORE_TIMEOUT_MS` (> 0)
//! - `GUIDEDFLOW_CRITICAL_FIELDS` (separados por coma)
//! - `GUIDEDFLOW_MAX_MISSING_FOR_MEDIUM`, `GUIDEDFLOW_MAX_WARNINGS_FOR_MEDIUM`
use std::env;
use std::time::Duration;

use flow_core::EngineConfig;
use flow_policies::ThresholdParams;
use log::warn;
use once_cell::sync::Lazy;

pub struct AppConfig {
    pub engine: EngineConfig,
    pub thresholds: ThresholdParams,
}

/// Instancia global perezosa de configuración, evaluada una sola vez.
pub static CONFIG: Lazy<AppConfig> = Lazy::new(|| {
    let _ = dotenvy::dotenv(); // ignora error si no existe .env
    AppConfig::from_lookup(|k| env::var(k).ok())
});

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, accept: impl Fn(&T) -> bool) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse::<T>() {
        Ok(v) if accept(&v) => Some(v),
        _ => {
            warn!("config:invalid key={key} value={raw:?} (se usa el default)");
            None
        }
    }
}

impl AppConfig {
    /// Construye la configuración a partir de una función de búsqueda
    /// (`env::var` en producción, un mapa en tests).
    pub fn from_lookup<F>(get: F) -> Self
        where F: Fn(&str) -> Option<String>
    {
        let ms = |key: &str, positive: bool| {
            parse_or::<u64>(key, get(key), |v| !positive || *v > 0).map(Duration::from_millis)
        };
        let mut engine = EngineConfig::default();
        if let Some(d) = ms("GUIDEDFLOW_PRICING_DEBOUNCE_MS", false) {
            engine = engine.with_pricing_debounce(d);
        }
        if let Some(d) = ms("GUIDEDFLOW_VALIDATION_DEBOUNCE_MS", false) {
            engine = engine.with_validation_debounce(d);
        }
        if let Some(d) = ms("GUIDEDFLOW_AUTOSAVE_INTERVAL_MS", false) {
            engine = engine.with_autosave_interval(d);
        }
        if let Some(d) = ms("GUIDEDFLOW_ORACLE_TIMEOUT_MS", true) {
            engine = engine.with_oracle_timeout(d);
        }
        if let Some(d) = ms("GUIDEDFLOW_STORE_TIMEOUT_MS", true) {
            engine = engine.with_store_timeout(d);
        }

        let mut thresholds = ThresholdParams::default();
        if let Some(raw) = get("GUIDEDFLOW_CRITICAL_FIELDS") {
            thresholds.critical_fields = raw.split(',')
                                            .map(str::trim)
                                            .filter(|s| !s.is_empty())
                                            .map(String::from)
                                            .collect();
        }
        let key = "GUIDEDFLOW_MAX_MISSING_FOR_MEDIUM";
        if let Some(n) = parse_or::<usize>(key, get(key), |_| true) {
            thresholds.max_missing_for_medium = n;
        }
        let key = "GUIDEDFLOW_MAX_WARNINGS_FOR_MEDIUM";
        if let Some(n) = parse_or::<usize>(key, get(key), |_| true) {
            thresholds.max_warnings_for_medium = n;
        }
        Self { engine, thresholds }
    }

    pub fn engine_config(&self) -> EngineConfig {
        self.engine
    }

    pub fn threshold_params(&self) -> ThresholdParams {
        self.thresholds.clone()
    }
}
