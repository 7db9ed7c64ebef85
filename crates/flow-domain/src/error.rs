use thiserror::Error;

/// Errores del modelo de datos.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid flow data: {0}")]
    InvalidFlowData(String),
    #[error("checksum mismatch (expected {expected}, found {found})")]
    ChecksumMismatch { expected: String, found: String },
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DomainError {
    fn from(e: serde_json::Error) -> Self {
        DomainError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_error_maps_to_serialization_variant() {
        let err: DomainError = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err().into();
        assert!(matches!(err, DomainError::Serialization(_)));
    }

    #[test]
    fn checksum_mismatch_format() {
        let err = DomainError::ChecksumMismatch { expected: "a".into(), found: "b".into() };
        assert_eq!(err.to_string(), "checksum mismatch (expected a, found b)");
    }
}
