//! Motor de flujo guiado: contenedor explícito de dependencias.
//!
//! Una instancia por sesión; cada coordinador se crea una vez y se pasa por
//! referencia, sin singletons globales.

pub mod builder;
pub mod core;

pub use self::builder::{EngineBuilder, EngineBuilderInit};
pub use self::core::GuidedFlowEngine;
