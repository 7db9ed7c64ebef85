//! guidedflow
//!
//! Librería de aplicación del flujo guiado:
//! - `config`: tiempos del motor y umbrales de confianza desde `.env`.
//! - `errors`: `AppError`, envoltorio de errores para binarios.
//!
//! El motor vive en `flow-core`; los colaboradores concretos en
//! `flow-adapters` y `flow-persistence`.

pub mod config;
pub mod errors;

pub use config::{AppConfig, CONFIG};
pub use errors::AppError;
