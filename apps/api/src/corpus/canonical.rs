//! Canonical JSON text and content hashes used for change detection.
//!
//! `serde_json::Map` is ordered by key (no `preserve_order` feature), so the
//! compact `Display` form of a `Value` is already canonical: sorted keys, no
//! insignificant whitespace, UTF-8 passed through unescaped.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Deterministic JSON text for hashing and upload.
pub fn canonical_json_text(value: &Value) -> String {
    value.to_string()
}

/// SHA-256 hex digest of the canonical JSON text.
pub fn canonical_json_sha256(value: &Value) -> String {
    sha256_hex(canonical_json_text(value).as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_change_hash() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": [1, 2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":[1,2],"b":1}"#).unwrap();
        assert_eq!(canonical_json_sha256(&a), canonical_json_sha256(&b));
    }

    #[test]
    fn test_canonical_text_is_compact_and_sorted() {
        let v = json!({"zeta": "ü", "alpha": null});
        assert_eq!(canonical_json_text(&v), r#"{"alpha":null,"zeta":"ü"}"#);
    }

    #[test]
    fn test_different_content_different_hash() {
        assert_ne!(
            canonical_json_sha256(&json!({"a": 1})),
            canonical_json_sha256(&json!({"a": 2}))
        );
    }
}
