//! Canonical JSON serialization and hashing.
//!
//! Message payloads are hashed and signed over their canonical form: object
//! keys sorted lexicographically at every level, no whitespace, arrays kept
//! in order. Ingress bytes that do not round-trip through the canonicalizer
//! are rejected, so `hash(bytes) == hash(canonicalize(parse(bytes)))` holds
//! for every accepted input.

use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::CodecError;

/// Canonicalize a serializable value.
///
/// Keys are sorted explicitly rather than relying on `serde_json`'s map
/// representation, so the output is stable regardless of feature flags.
pub fn canonicalize<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let v = serde_json::to_value(value).map_err(|_| CodecError::InvalidFormat)?;
    Ok(canonicalize_value(&v))
}

/// Canonicalize an already-parsed `serde_json::Value`.
pub fn canonicalize_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);

            let mut out = String::from("{");
            for (i, (k, v)) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json string serialization never fails
                out.push_str(&serde_json::to_string(k).unwrap_or_default());
                out.push(':');
                out.push_str(&canonicalize_value(v));
            }
            out.push('}');
            out
        }
        serde_json::Value::Array(arr) => {
            let mut out = String::from("[");
            for (i, v) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&canonicalize_value(v));
            }
            out.push(']');
            out
        }
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// SHA-256 of the input, base64-encoded. Message hashes and the peer-blob
/// checksum both go through this.
pub fn sha256_b64(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Raw SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalize_sorts_keys() {
        let v = json!({"b": 1, "a": 2});
        assert_eq!(canonicalize_value(&v), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn canonicalize_nested() {
        let v = json!({"z": {"b": 1, "a": 2}, "a": []});
        assert_eq!(canonicalize_value(&v), r#"{"a":[],"z":{"a":2,"b":1}}"#);
    }

    #[test]
    fn canonicalize_preserves_array_order() {
        let v = json!([3, 1, 2]);
        assert_eq!(canonicalize_value(&v), "[3,1,2]");
    }

    #[test]
    fn canonicalize_escapes_strings() {
        let v = json!({"msg": "hello \"world\""});
        assert_eq!(canonicalize_value(&v), r#"{"msg":"hello \"world\""}"#);
    }

    #[test]
    fn hash_is_deterministic() {
        let v = json!({"timestamp": 1, "type": "rating"});
        let a = sha256_b64(canonicalize_value(&v).as_bytes());
        let b = sha256_b64(canonicalize_value(&v).as_bytes());
        assert_eq!(a, b);
        // 32 bytes of digest → 44 chars of padded base64
        assert_eq!(a.len(), 44);
    }
}
