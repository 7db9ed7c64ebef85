//! Constantes del motor de coordinación.
//!
//! Valores por defecto de `EngineConfig`. Cambiarlos altera tiempos de
//! publicación observables por la UI, no la semántica de los resultados.

/// Ventana de debounce del recálculo de precio.
pub const DEFAULT_PRICING_DEBOUNCE_MS: u64 = 1_000;
/// Ventana de debounce de la validación cruzada.
pub const DEFAULT_VALIDATION_DEBOUNCE_MS: u64 = 1_000;
/// Intervalo de coalescencia del autosave.
pub const DEFAULT_AUTOSAVE_INTERVAL_MS: u64 = 30_000;
/// Límite por llamada al oráculo de precios.
pub const DEFAULT_ORACLE_TIMEOUT_MS: u64 = 10_000;
/// Límite por llamada al store de borradores.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 10_000;
