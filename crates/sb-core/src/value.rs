//! Dynamically typed attribute values
//!
//! Events carry heterogeneous flat attribute maps (booleans, integers,
//! floats, strings). Conditions and placeholders operate on the value's
//! dynamic tag rather than on per-model types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single attribute value of a raw event.
///
/// The variant order matters for untagged deserialization: integers must be
/// tried before floats so that `5` stays an `Int`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttrValue {
    /// Convert a JSON value into an attribute value.
    ///
    /// Returns `None` for JSON null. Arrays and objects are kept as their
    /// JSON text so they remain comparable and printable.
    pub fn from_json(value: &serde_json::Value) -> Option<AttrValue> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(AttrValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(AttrValue::Int(i))
                } else {
                    n.as_f64().map(AttrValue::Float)
                }
            }
            serde_json::Value::String(s) => Some(AttrValue::Str(s.clone())),
            other => Some(AttrValue::Str(other.to_string())),
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(i) => Some(*i as f64),
            AttrValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Name of the dynamic type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Bool(_) => "bool",
            AttrValue::Int(_) => "int",
            AttrValue::Float(_) => "float",
            AttrValue::Str(_) => "string",
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Float(v) => write!(f, "{}", v),
            AttrValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_scalars() {
        assert_eq!(AttrValue::from_json(&json!(true)), Some(AttrValue::Bool(true)));
        assert_eq!(AttrValue::from_json(&json!(5)), Some(AttrValue::Int(5)));
        assert_eq!(AttrValue::from_json(&json!(28.5)), Some(AttrValue::Float(28.5)));
        assert_eq!(
            AttrValue::from_json(&json!("WoSensorTH")),
            Some(AttrValue::Str("WoSensorTH".to_string()))
        );
        assert_eq!(AttrValue::from_json(&json!(null)), None);
    }

    #[test]
    fn test_from_json_compound_is_stringified() {
        let v = AttrValue::from_json(&json!({"a": 1})).unwrap();
        assert_eq!(v, AttrValue::Str("{\"a\":1}".to_string()));
    }

    #[test]
    fn test_display() {
        assert_eq!(AttrValue::Bool(false).to_string(), "false");
        assert_eq!(AttrValue::Int(-42).to_string(), "-42");
        assert_eq!(AttrValue::Float(28.5).to_string(), "28.5");
        assert_eq!(AttrValue::Str("x".into()).to_string(), "x");
    }

    #[test]
    fn test_as_f64() {
        assert_eq!(AttrValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(AttrValue::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(AttrValue::Bool(true).as_f64(), None);
        assert_eq!(AttrValue::Str("1.5".into()).as_f64(), None);
    }

    #[test]
    fn test_untagged_deserialize_keeps_integers() {
        let v: AttrValue = serde_json::from_str("5").unwrap();
        assert_eq!(v, AttrValue::Int(5));
        let v: AttrValue = serde_json::from_str("5.5").unwrap();
        assert_eq!(v, AttrValue::Float(5.5));
    }
}
