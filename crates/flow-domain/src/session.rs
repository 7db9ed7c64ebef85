use serde::{Deserialize, Serialize};

/// Contexto de sesión entregado por la capa de autenticación: quién edita y
/// qué estimación. `estimate_id` es la clave natural de sharding de todos los
/// coordinadores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub principal_id: String,
    pub estimate_id: String,
}

impl SessionContext {
    pub fn new(principal_id: impl Into<String>, estimate_id: impl Into<String>) -> Self {
        Self { principal_id: principal_id.into(),
               estimate_id: estimate_id.into() }
    }
}
