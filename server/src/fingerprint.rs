//! Deterministic cache keys over `(namespace, argument value)`.
//!
//! The fingerprint is a SHA-256 hex digest of a canonical JSON serialization
//! of the argument. Canonicalization sorts object keys recursively so that
//! two maps with the same entries always fingerprint identically; array order
//! is significant. The digest is lowercase hex and therefore filesystem-safe.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Compute the fingerprint for an argument value in a namespace.
///
/// Namespace and canonical argument bytes are length-prefixed before hashing
/// so `("ab", "c")` and `("a", "bc")` cannot collide.
pub fn fingerprint<A: Serialize>(namespace: &str, arg: &A) -> String {
    let value = serde_json::to_value(arg).unwrap_or(Value::Null);
    let canonical = canonical_json(&value);

    let mut hasher = Sha256::new();
    hasher.update((namespace.len() as u64).to_le_bytes());
    hasher.update(namespace.as_bytes());
    hasher.update((canonical.len() as u64).to_le_bytes());
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The composite in-memory key: `namespace:fingerprint`.
pub fn full_key(namespace: &str, fp: &str) -> String {
    format!("{namespace}:{fp}")
}

/// Split a composite key on the first colon only.
///
/// Namespaces never contain `:`, but fingerprints are hex so the first colon
/// is always the separator.
pub fn split_key(full: &str) -> Option<(&str, &str)> {
    full.split_once(':')
}

/// Serialize a JSON value with recursively sorted object keys.
///
/// `serde_json::Map` ordering depends on the `preserve_order` feature, which
/// any transitive dependency can switch on; an explicit writer keeps the
/// fingerprint stable regardless.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => {
            out.push_str(&serde_json::to_string(other).unwrap_or_default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deterministic_for_equal_inputs() {
        let a = json!({ "id": 1, "q": "rust" });
        assert_eq!(fingerprint("ns", &a), fingerprint("ns", &a));
    }

    #[test]
    fn object_key_order_is_irrelevant() {
        // serde_json::json! preserves no insertion order guarantee we can rely
        // on, so canonicalize from raw strings parsed in different orders.
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(fingerprint("ns", &a), fingerprint("ns", &b));
    }

    #[test]
    fn array_order_is_significant() {
        let a = json!([1, 2, 3]);
        let b = json!([3, 2, 1]);
        assert_ne!(fingerprint("ns", &a), fingerprint("ns", &b));
    }

    #[test]
    fn namespace_is_part_of_the_key() {
        let arg = json!({ "q": "x" });
        assert_ne!(fingerprint("googleSearch", &arg), fingerprint("newsSearch", &arg));
    }

    #[test]
    fn digest_is_filesystem_safe_hex() {
        let fp = fingerprint("ns", &json!({ "path": "../../etc" }));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn nested_objects_canonicalize() {
        let a: Value = serde_json::from_str(r#"{"outer":{"z":1,"a":[{"y":2,"x":3}]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"outer":{"a":[{"x":3,"y":2}],"z":1}}"#).unwrap();
        assert_eq!(fingerprint("ns", &a), fingerprint("ns", &b));
    }

    #[test]
    fn split_key_on_first_colon_only() {
        let (ns, fp) = split_key("scrapePage:abc:def").unwrap();
        assert_eq!(ns, "scrapePage");
        assert_eq!(fp, "abc:def");
    }
}
