//! Typed state values
//!
//! Every entry in an execution state is a `Value`. The encoding is
//! self-describing so serialized states can be inspected and migrated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed value stored under a state key.
///
/// Maps are ordered so canonical serialization is stable across runs,
/// which the state checksum depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// UTF-8 string scalar
    String(String),
    /// Signed 64-bit integer scalar
    Int(i64),
    /// 64-bit float scalar
    Float(f64),
    /// Boolean scalar
    Bool(bool),
    /// UTC timestamp
    Timestamp(DateTime<Utc>),
    /// Opaque bytes
    Binary(Vec<u8>),
    /// Ordered list of values
    List(Vec<Value>),
    /// Nested state map
    Map(BTreeMap<String, Value>),
}

/// Discriminant of a [`Value`], used for type-stability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    Binary,
    List,
    Map,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
            Self::Binary => "binary",
            Self::List => "list",
            Self::Map => "map",
        };
        f.write_str(name)
    }
}

impl Value {
    /// The kind tag of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::String(_) => ValueKind::String,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Bool(_) => ValueKind::Bool,
            Self::Timestamp(_) => ValueKind::Timestamp,
            Self::Binary(_) => ValueKind::Binary,
            Self::List(_) => ValueKind::List,
            Self::Map(_) => ValueKind::Map,
        }
    }

    /// True for string/int/float/bool scalars.
    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::String(_) | Self::Int(_) | Self::Float(_) | Self::Bool(_))
    }

    /// Borrow as `&str` if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Read as `i64` if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Read as `f64`; integers widen.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(x) => Some(*x),
            Self::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Read as `bool` if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Read the timestamp if this is one.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Borrow the list items if this is a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow the entries if this is a map.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// True when `other` would be a type-compatible overwrite of `self`.
    ///
    /// Int and Float are interchangeable numerics; all other kinds must
    /// match exactly.
    pub fn same_kind_as(&self, other: &Value) -> bool {
        let numeric =
            |k: ValueKind| matches!(k, ValueKind::Int | ValueKind::Float);
        self.kind() == other.kind() || (numeric(self.kind()) && numeric(other.kind()))
    }

    /// Plain (untagged) JSON view, for deserializing into caller types.
    /// Timestamps become RFC 3339 strings, binary becomes a byte array.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Int(n) => serde_json::json!(n),
            Self::Float(x) => serde_json::json!(x),
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
            Self::Binary(bytes) => serde_json::json!(bytes),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Self::Map(entries) => serde_json::Value::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Timestamp(t)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self::Map(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_accessors() {
        assert_eq!(Value::from("hi").kind(), ValueKind::String);
        assert_eq!(Value::from(3i64).as_int(), Some(3));
        assert_eq!(Value::from(3i64).as_float(), Some(3.0));
        assert_eq!(Value::from(2.5).as_float(), Some(2.5));
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert!(Value::from("hi").is_scalar());
        assert!(!Value::List(vec![]).is_scalar());
    }

    #[test]
    fn test_numeric_kinds_are_compatible() {
        assert!(Value::Int(1).same_kind_as(&Value::Float(2.0)));
        assert!(!Value::Int(1).same_kind_as(&Value::Bool(true)));
        assert!(Value::List(vec![]).same_kind_as(&Value::List(vec![Value::Int(1)])));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("n".to_string(), Value::Int(7));
        map.insert("tags".to_string(), Value::List(vec![Value::from("a"), Value::from("b")]));
        let value = Value::Map(map);

        let json = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_encoding_is_self_describing() {
        let json = serde_json::to_value(Value::Int(5)).unwrap();
        assert_eq!(json["type"], "int");
        assert_eq!(json["value"], 5);
    }

    #[test]
    fn test_plain_json_view() {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), Value::from("ada"));
        map.insert("age".to_string(), Value::Int(36));
        let value = Value::Map(map);

        let json = value.to_json();
        assert_eq!(json["name"], "ada");
        assert_eq!(json["age"], 36);
    }
}
