//! Contrato del oráculo de precios externo.
use async_trait::async_trait;
use flow_domain::{Measurements, ServiceCost, ServiceSelection};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    #[error("invalid oracle input: {0}")]
    InvalidInput(String),
}

/// Función remota (posiblemente lenta) que cotiza un servicio a partir de
/// las medidas del formulario. Debe ser pura: mismas entradas, mismo costo.
#[async_trait]
pub trait PricingOracle: Send + Sync + std::fmt::Debug {
    async fn compute_service_cost(&self,
                                  selection: &ServiceSelection,
                                  measurements: &Measurements)
                                  -> Result<ServiceCost, OracleError>;
}
