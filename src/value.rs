//! Cell value model
//!
//! Every cell holds one `Value`. The enum is serialized untagged so the wire
//! shape is plain JSON (`true`, `75`, `0.5`, `"auto"`, `{...}`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tagged cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Map(serde_json::Map<String, serde_json::Value>),
}

/// Value type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Str,
    Map,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Bool => "boolean",
            ValueKind::Int => "integer",
            ValueKind::Float => "float",
            ValueKind::Str => "string",
            ValueKind::Map => "mapping",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Value {
    /// Type tag of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Map(_) => ValueKind::Map,
        }
    }

    /// Convert from raw JSON. `null` and arrays have no cell representation.
    pub fn from_json(json: serde_json::Value) -> Option<Value> {
        match json {
            serde_json::Value::Bool(b) => Some(Value::Bool(b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Value::Int(i)),
                None => n.as_f64().map(Value::Float),
            },
            serde_json::Value::String(s) => Some(Value::Str(s)),
            serde_json::Value::Object(map) => Some(Value::Map(map)),
            serde_json::Value::Null | serde_json::Value::Array(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            // Non-finite floats never pass validation, so the fallback is unreachable in practice
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Map(m) => serde_json::Value::Object(m.clone()),
        }
    }

    /// Widen an integer to a float when the target cell is a float cell.
    /// Every other combination is returned untouched.
    pub fn coerce_to(self, kind: ValueKind) -> Value {
        match (self, kind) {
            (Value::Int(i), ValueKind::Float) => Value::Float(i as f64),
            (value, _) => value,
        }
    }

    /// Numeric view for range checks
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_untagged_wire_shape() {
        let v: Value = serde_json::from_value(json!(75)).unwrap();
        assert_eq!(v, Value::Int(75));

        let v: Value = serde_json::from_value(json!(0.5)).unwrap();
        assert_eq!(v, Value::Float(0.5));

        let v: Value = serde_json::from_value(json!({"dhcp": true})).unwrap();
        assert_eq!(v.kind(), ValueKind::Map);

        assert_eq!(serde_json::to_value(Value::from("auto")).unwrap(), json!("auto"));
    }

    #[test]
    fn test_null_and_array_rejected() {
        assert!(Value::from_json(json!(null)).is_none());
        assert!(Value::from_json(json!([1, 2])).is_none());
    }

    #[test]
    fn test_int_widens_to_float_only() {
        assert_eq!(Value::Int(3).coerce_to(ValueKind::Float), Value::Float(3.0));
        assert_eq!(Value::Int(3).coerce_to(ValueKind::Str), Value::Int(3));
        assert_eq!(Value::Float(1.5).coerce_to(ValueKind::Int), Value::Float(1.5));
    }
}
