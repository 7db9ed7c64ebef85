//! Hashes de contenido (blake3 sobre JSON canónico). Los coordinadores sólo
//! usan `flow_data_hash` para detectar snapshots idénticos.

use blake3::Hasher;
use flow_domain::GuidedFlowData;
use serde_json::Value;

use super::to_canonical_json;

/// Hashea un string y devuelve hex.
pub fn hash_str(input: &str) -> String {
    let mut h = Hasher::new();
    h.update(input.as_bytes());
    h.finalize().to_hex().to_string()
}

pub fn hash_value(value: &Value) -> String {
    hash_str(&to_canonical_json(value))
}

/// Hash estructural de un snapshot de flujo: dos snapshots con el mismo
/// contenido producen el mismo hash sin comparar strings JSON completos.
pub fn flow_data_hash(data: &GuidedFlowData) -> String {
    hash_value(&data.to_value())
}
