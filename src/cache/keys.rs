//! Canonical string keys for query scopes and record ids.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Result, StoreError};

/// Scope key used for the empty parameter set.
pub const EMPTY_SCOPE: &str = "";

/// Identifier of a cached record.
///
/// Numeric and string ids are distinct: `1` and `"1"` never share a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
  Int(i64),
  Str(String),
}

impl RecordId {
  /// Build an id from a JSON value. Only integers and strings are accepted.
  pub fn from_value(value: &Value) -> Result<Self> {
    match value {
      Value::String(s) => Ok(RecordId::Str(s.clone())),
      Value::Number(n) => n
        .as_i64()
        .map(RecordId::Int)
        .ok_or_else(|| StoreError::InvalidId(n.to_string())),
      other => Err(StoreError::InvalidId(other.to_string())),
    }
  }

  pub fn to_value(&self) -> Value {
    match self {
      RecordId::Int(n) => Value::from(*n),
      RecordId::Str(s) => Value::from(s.as_str()),
    }
  }
}

impl From<i64> for RecordId {
  fn from(n: i64) -> Self {
    RecordId::Int(n)
  }
}

impl From<i32> for RecordId {
  fn from(n: i32) -> Self {
    RecordId::Int(n.into())
  }
}

impl From<u32> for RecordId {
  fn from(n: u32) -> Self {
    RecordId::Int(n.into())
  }
}

impl From<&str> for RecordId {
  fn from(s: &str) -> Self {
    RecordId::Str(s.to_string())
  }
}

impl From<String> for RecordId {
  fn from(s: String) -> Self {
    RecordId::Str(s)
  }
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&encode_id(self))
  }
}

/// Encode a record id so that its type survives the trip through a text
/// column: `5` stays `5`, `"5"` becomes `"5"` with the quotes.
pub fn encode_id(id: &RecordId) -> String {
  id.to_value().to_string()
}

/// Inverse of [`encode_id`].
pub fn decode_id(encoded: &str) -> Result<RecordId> {
  let value: Value = serde_json::from_str(encoded)
    .map_err(|_| StoreError::InvalidId(encoded.to_string()))?;
  RecordId::from_value(&value)
}

/// Encode query parameters into a scope key.
///
/// Structurally equal parameters give the same key whatever their key order.
/// `null` and `{}` map to [`EMPTY_SCOPE`].
pub fn encode_scope(params: &Value) -> String {
  match params {
    Value::Null => return EMPTY_SCOPE.to_string(),
    Value::Object(map) if map.is_empty() => return EMPTY_SCOPE.to_string(),
    _ => {}
  }

  let canonical = canonicalize(params).to_string();

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(canonical.as_bytes());
  hex::encode(hasher.finalize())
}

/// Rebuild a value with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      let mut sorted = Map::new();
      for key in keys {
        sorted.insert(key.clone(), canonicalize(&map[key]));
      }
      Value::Object(sorted)
    }
    Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
    other => other.clone(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_empty_scope() {
    assert_eq!(encode_scope(&json!({})), EMPTY_SCOPE);
    assert_eq!(encode_scope(&Value::Null), EMPTY_SCOPE);
  }

  #[test]
  fn test_scope_ignores_key_order() {
    let a: Value = serde_json::from_str(r#"{"page":2,"filter":{"b":1,"a":[{"y":1,"x":2}]}}"#).unwrap();
    let b: Value = serde_json::from_str(r#"{"filter":{"a":[{"x":2,"y":1}],"b":1},"page":2}"#).unwrap();
    assert_eq!(encode_scope(&a), encode_scope(&b));
    assert_eq!(encode_scope(&a).len(), 64);
  }

  #[test]
  fn test_distinct_scopes() {
    assert_ne!(
      encode_scope(&json!({"page": 1})),
      encode_scope(&json!({"page": 2}))
    );
    assert_ne!(
      encode_scope(&json!({"page": 1})),
      encode_scope(&json!({"page": "1"}))
    );
  }

  #[test]
  fn test_id_type_fidelity() {
    let numeric = encode_id(&RecordId::Int(1));
    let string = encode_id(&RecordId::from("1"));
    assert_ne!(numeric, string);
    assert_eq!(decode_id(&numeric).unwrap(), RecordId::Int(1));
    assert_eq!(decode_id(&string).unwrap(), RecordId::from("1"));
  }

  #[test]
  fn test_invalid_ids() {
    assert!(RecordId::from_value(&json!(1.5)).is_err());
    assert!(RecordId::from_value(&json!(true)).is_err());
    assert!(RecordId::from_value(&json!({"id": 1})).is_err());
    assert!(decode_id("not json").is_err());
  }
}
