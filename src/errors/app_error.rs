use flow_core::FlowError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Error del motor: {0}")]
    Flow(#[from] FlowError),
    #[error("Error en IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error de configuración: {0}")]
    Config(String),
}

impl AppError {
    /// Código de salida del proceso para este error.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Flow(FlowError::DraftNotFound(_)) => 4,
            AppError::Config(_) | AppError::Flow(FlowError::Config(_)) => 2,
            _ => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_errors_are_wrapped_with_context() {
        let err: AppError = FlowError::OracleUnavailable("down".into()).into();
        assert!(err.to_string().starts_with("Error del motor:"));
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn io_variant_from() {
        let err: AppError = std::io::Error::other("falló IO").into();
        assert_eq!(err.to_string(), "Error en IO: falló IO");
    }

    #[test]
    fn config_errors_exit_with_usage_code() {
        assert_eq!(AppError::Config("mala configuración".into()).exit_code(), 2);
        assert_eq!(AppError::Flow(FlowError::Config("graph".into())).exit_code(), 2);
        assert_eq!(AppError::Flow(FlowError::DraftNotFound(uuid::Uuid::nil())).exit_code(), 4);
    }
}
