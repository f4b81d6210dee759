//! Canonical JSON and SHA-256 fingerprints.
//!
//! Used for export bundle checksums and action idempotency keys. Canonical
//! form: object keys sorted, no whitespace, strings escaped minimally.

use crate::error::Result;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Hex SHA-256 of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Renders a JSON value in canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// SHA-256 of the canonical JSON of any serializable value.
pub fn checksum<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let json = serde_json::to_value(value)?;
    Ok(sha256_hex(canonical_json(&json).as_bytes()))
}

/// Deduplication key for one action of one rule on one request.
pub fn idempotency_key(request_id: &str, rule_id: &str, action_type: &str) -> String {
    sha256_hex(format!("{}:{}:{}", request_id, rule_id, action_type).as_bytes())
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "{}", n);
        }
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, &map[key]);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_recursively() {
        let value = json!({"z": {"b": 2, "a": 1}, "a": [3, 1, 2]});
        assert_eq!(canonical_json(&value), r#"{"a":[3,1,2],"z":{"a":1,"b":2}}"#);
    }

    #[test]
    fn test_escapes() {
        assert_eq!(canonical_json(&json!("a\n\"b\"")), r#""a\n\"b\"""#);
    }

    #[test]
    fn test_checksum_ignores_key_order() {
        let a = checksum(&json!({"x": 1, "y": [true, null]})).unwrap();
        let b = checksum(&json!({"y": [true, null], "x": 1})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let first = idempotency_key("req-1", "rule-1", "block");
        assert_eq!(first, idempotency_key("req-1", "rule-1", "block"));
        assert_ne!(first, idempotency_key("req-1", "rule-1", "alert"));
        assert_eq!(first, sha256_hex(b"req-1:rule-1:block"));
    }
}
