//! Canonical JSON fingerprints.
//!
//! Object keys are sorted recursively and the compact encoding is hashed with
//! SHA-256. Two payloads that differ only in key order fingerprint the same.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Recursively sort object keys. Arrays keep their order; callers that want
/// order-insensitive arrays must sort them before fingerprinting.
pub fn canonical_json(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonical_json(&map[&k]));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonical_json).collect()),
        _ => v.clone(),
    }
}

/// Hex SHA-256 of the canonical compact encoding of `v`.
pub fn fingerprint_value(v: &Value) -> String {
    let canonical = canonical_json(v);
    // Value -> String cannot fail: keys are strings and there are no
    // non-finite floats in a Value.
    let encoded = canonical.to_string();
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_fingerprint() {
        let a = json!({"b": 1, "a": {"y": 2, "x": [1, 2]}});
        let b = json!({"a": {"x": [1, 2], "y": 2}, "b": 1});
        assert_eq!(fingerprint_value(&a), fingerprint_value(&b));
    }

    #[test]
    fn array_order_is_significant() {
        let a = json!({"a": [1, 2]});
        let b = json!({"a": [2, 1]});
        assert_ne!(fingerprint_value(&a), fingerprint_value(&b));
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint_value(&json!({}));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
