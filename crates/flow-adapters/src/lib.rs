//! flow-adapters: colaboradores concretos del motor.
//!
//! - `RateTablePricingOracle`: oráculo de precios basado en tarifas por
//!   servicio (base + tarifa por unidad + multiplicadores).
//! - `standard_graph`: layout de steps del estimador (medidas, selección de
//!   servicios, detalles, revisión).

pub mod layout;
pub mod rate_table;

pub use layout::{standard_graph, STEP_DETAILS, STEP_MEASUREMENTS, STEP_REVIEW, STEP_SERVICES};
pub use rate_table::{Multiplier, RateCard, RateTablePricingOracle};
