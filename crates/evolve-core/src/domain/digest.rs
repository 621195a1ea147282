//! Canonical JSON and SHA256 digests for audit records.
//!
//! Invocation params are logged by digest rather than verbatim; two calls
//! with the same params (regardless of key order) share a digest.

use sha2::{Digest, Sha256};

/// Recursively sort object keys so serialization is order-independent.
fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), sort_keys(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => serde_json::Value::Array(arr.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Canonical compact JSON string.
pub fn canonical_json(value: &serde_json::Value) -> String {
    sort_keys(value).to_string()
}

/// SHA256 hex digest of the canonical JSON form.
pub fn params_digest(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}
