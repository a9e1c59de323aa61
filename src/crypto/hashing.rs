// src/crypto/hashing.rs
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Raw sha256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Rebuild a JSON value with every object's keys in lexicographic order.
/// Two values that differ only in field insertion order canonicalize to the
/// same bytes.
pub fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonical_json(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// Canonical serialized bytes of any serializable value.
pub fn canonical_bytes<T: Serialize>(data: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(data)?;
    serde_json::to_vec(&canonical_json(&value))
}

/// sha256 hex digest over the canonical serialization of `data`.
pub fn hash_canonical<T: Serialize>(data: &T) -> Result<String, serde_json::Error> {
    Ok(hex::encode(sha256(&canonical_bytes(data)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_order_does_not_change_hash() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":[{"q":1,"p":2}]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":[{"p":2,"q":1}],"y":2},"b":1}"#).unwrap();
        assert_eq!(hash_canonical(&a).unwrap(), hash_canonical(&b).unwrap());
    }

    #[test]
    fn content_changes_hash() {
        let a = json!({"from": "0x1", "value": 10});
        let b = json!({"from": "0x1", "value": 11});
        assert_ne!(hash_canonical(&a).unwrap(), hash_canonical(&b).unwrap());
    }

    #[test]
    fn array_order_is_significant() {
        let a = json!([1, 2]);
        let b = json!([2, 1]);
        assert_ne!(hash_canonical(&a).unwrap(), hash_canonical(&b).unwrap());
    }
}
