//! Dataref value types

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::{LinkError, Result};

/// Value type of a dataref, as reported by the simulator directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Int,
    Float,
    Double,
    IntArray,
    FloatArray,
    /// Byte blob, transported base64 encoded and exposed as a string
    Data,
}

impl ValueType {
    /// Whether values of this type are arrays that support per-index subscription.
    pub const fn is_array(&self) -> bool {
        matches!(self, ValueType::IntArray | ValueType::FloatArray)
    }
}

/// Current value of a dataref.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// No value received yet
    #[default]
    None,
    Int(i64),
    Float(f64),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    String(String),
}

impl Value {
    /// Decode a scalar or whole-array payload of the given type.
    pub fn from_json(value_type: ValueType, payload: &serde_json::Value) -> Result<Value> {
        match value_type {
            ValueType::Int => Ok(Value::Int(json_i64(payload)?)),
            ValueType::Float | ValueType::Double => Ok(Value::Float(json_f64(payload)?)),
            ValueType::IntArray => {
                Ok(Value::IntArray(json_array(payload)?.iter().map(json_i64).collect::<Result<_>>()?))
            }
            ValueType::FloatArray => {
                Ok(Value::FloatArray(json_array(payload)?.iter().map(json_f64).collect::<Result<_>>()?))
            }
            ValueType::Data => {
                let encoded = payload
                    .as_str()
                    .ok_or_else(|| LinkError::decode("data value", format!("expected string, got {}", payload)))?;
                decode_data(encoded).map(Value::String)
            }
        }
    }

    /// Encode for a write request.
    ///
    /// Strings are base64 encoded, as the simulator expects for `data` datarefs.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::None => serde_json::Value::Null,
            Value::Int(v) => serde_json::json!(v),
            Value::Float(v) => serde_json::json!(v),
            Value::IntArray(v) => serde_json::json!(v),
            Value::FloatArray(v) => serde_json::json!(v),
            Value::String(s) => serde_json::Value::String(STANDARD.encode(s.as_bytes())),
        }
    }

    /// Numeric view of a scalar value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Element `index` of an array value, as a scalar value.
    pub fn element(&self, index: usize) -> Option<Value> {
        match self {
            Value::IntArray(v) => v.get(index).copied().map(Value::Int),
            Value::FloatArray(v) => v.get(index).copied().map(Value::Float),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }
}

/// Decode a base64 `data` payload, dropping NUL bytes.
pub fn decode_data(encoded: &str) -> Result<String> {
    let mut bytes = STANDARD.decode(encoded).map_err(|e| LinkError::decode("data value", e.to_string()))?;
    bytes.retain(|b| *b != 0);
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub(crate) fn json_array(payload: &serde_json::Value) -> Result<&Vec<serde_json::Value>> {
    payload
        .as_array()
        .ok_or_else(|| LinkError::decode("array value", format!("expected array, got {}", payload)))
}

pub(crate) fn json_i64(payload: &serde_json::Value) -> Result<i64> {
    payload
        .as_i64()
        .or_else(|| payload.as_f64().map(|v| v as i64))
        .ok_or_else(|| LinkError::decode("int value", format!("expected number, got {}", payload)))
}

pub(crate) fn json_f64(payload: &serde_json::Value) -> Result<f64> {
    payload
        .as_f64()
        .ok_or_else(|| LinkError::decode("float value", format!("expected number, got {}", payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_type_uses_directory_names() {
        let parsed: ValueType = serde_json::from_value(json!("float_array")).unwrap();
        assert_eq!(parsed, ValueType::FloatArray);
        assert!(parsed.is_array());
        assert_eq!(serde_json::to_value(ValueType::Data).unwrap(), json!("data"));
        assert!(!ValueType::Double.is_array());
    }

    #[test]
    fn data_strips_nul_bytes() {
        // "ABC\0\0"
        assert_eq!(decode_data("QUJDAAA=").unwrap(), "ABC");
        assert!(decode_data("not base64!").is_err());
    }

    #[test]
    fn scalars_decode_by_type() {
        assert_eq!(Value::from_json(ValueType::Int, &json!(3)).unwrap(), Value::Int(3));
        assert_eq!(Value::from_json(ValueType::Int, &json!(3.0)).unwrap(), Value::Int(3));
        assert_eq!(Value::from_json(ValueType::Double, &json!(1.5)).unwrap(), Value::Float(1.5));
        assert!(Value::from_json(ValueType::Float, &json!("x")).is_err());
    }

    #[test]
    fn arrays_decode_whole() {
        let value = Value::from_json(ValueType::FloatArray, &json!([1.0, 2.5])).unwrap();
        assert_eq!(value, Value::FloatArray(vec![1.0, 2.5]));
        assert_eq!(value.element(1), Some(Value::Float(2.5)));
        assert_eq!(value.element(2), None);
        assert!(Value::from_json(ValueType::IntArray, &json!(4)).is_err());
    }

    #[test]
    fn strings_encode_as_base64() {
        assert_eq!(Value::String("ABC".into()).to_json(), json!("QUJD"));
        assert_eq!(Value::Float(2.0).to_json(), json!(2.0));
        assert_eq!(Value::None.to_json(), serde_json::Value::Null);
    }
}
