use std::fmt;
use std::str::FromStr;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use bytes::Bytes;
use chrono::NaiveDateTime;
use pt::ColumnKind;
use rust_decimal::Decimal;

use array::ArrayValue;

pub mod array;

/// A typed cell value. Every variant maps onto one of the generic column
/// kinds; connectors convert to and from their native representations.
#[derive(Debug, PartialEq, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Numeric(Decimal),
    Text(String),
    Timestamp(NaiveDateTime),
    Binary(Bytes),
    Json(serde_json::Value),
    Array(ArrayValue),
}

impl Value {
    pub fn kind(&self) -> Option<ColumnKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnKind::Bool),
            Value::Integer(_) => Some(ColumnKind::Int32),
            Value::BigInt(_) => Some(ColumnKind::Int64),
            Value::Float(_) => Some(ColumnKind::Float32),
            Value::Double(_) => Some(ColumnKind::Float64),
            Value::Numeric(_) => Some(ColumnKind::Numeric),
            Value::Text(_) => Some(ColumnKind::String),
            Value::Timestamp(_) => Some(ColumnKind::Timestamp),
            Value::Binary(_) => Some(ColumnKind::Bytes),
            Value::Json(_) => Some(ColumnKind::Json),
            Value::Array(arr) => Some(ColumnKind::Array(Box::new(match arr {
                ArrayValue::Empty | ArrayValue::Text(_) => ColumnKind::String,
                ArrayValue::Bool(_) => ColumnKind::Bool,
                ArrayValue::Integer(_) => ColumnKind::Int32,
                ArrayValue::BigInt(_) => ColumnKind::Int64,
                ArrayValue::Float(_) => ColumnKind::Float32,
                ArrayValue::Double(_) => ColumnKind::Float64,
                ArrayValue::Timestamp(_) => ColumnKind::Timestamp,
            }))),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn to_serde_json_value(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(n) => serde_json::Value::Number((*n).into()),
            Value::BigInt(n) => serde_json::Value::Number((*n).into()),
            Value::Float(n) => serde_json::Number::from_f64(f64::from(*n))
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Double(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Numeric(n) => serde_json::Value::String(n.to_string()),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_string()),
            Value::Binary(b) => serde_json::Value::String(BASE64_STANDARD.encode(b)),
            Value::Json(v) => v.clone(),
            Value::Array(arr) => arr.to_serde_json_value(),
        }
    }

    /// Reconstruct a value from its raw-table JSON encoding, guided by the
    /// column kind the destination schema declares.
    pub fn from_serde_json_value(kind: &ColumnKind, value: &serde_json::Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        match kind {
            ColumnKind::Bool => value.as_bool().map(Value::Bool).unwrap_or(Value::Null),
            ColumnKind::Int32 => value
                .as_i64()
                .map(|n| Value::Integer(n as i32))
                .unwrap_or(Value::Null),
            ColumnKind::Int64 => value.as_i64().map(Value::BigInt).unwrap_or(Value::Null),
            ColumnKind::Float32 => value
                .as_f64()
                .map(|n| Value::Float(n as f32))
                .unwrap_or(Value::Null),
            ColumnKind::Float64 => value.as_f64().map(Value::Double).unwrap_or(Value::Null),
            ColumnKind::Numeric => value
                .as_str()
                .and_then(|s| Decimal::from_str(s).ok())
                .map(Value::Numeric)
                .unwrap_or(Value::Null),
            ColumnKind::String => value
                .as_str()
                .map(|s| Value::Text(s.to_owned()))
                .unwrap_or(Value::Null),
            ColumnKind::Timestamp => value
                .as_str()
                .and_then(|s| {
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                        .or_else(|_| NaiveDateTime::from_str(s))
                        .ok()
                })
                .map(Value::Timestamp)
                .unwrap_or(Value::Null),
            ColumnKind::Bytes => value
                .as_str()
                .and_then(|s| BASE64_STANDARD.decode(s).ok())
                .map(|b| Value::Binary(Bytes::from(b)))
                .unwrap_or(Value::Null),
            ColumnKind::Json => Value::Json(value.clone()),
            ColumnKind::Array(_) => Value::Json(value.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_serde_json_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_scalars() {
        let cases = vec![
            (ColumnKind::Bool, Value::Bool(true)),
            (ColumnKind::Int32, Value::Integer(42)),
            (ColumnKind::Int64, Value::BigInt(1 << 40)),
            (ColumnKind::String, Value::Text("hello".to_owned())),
            (
                ColumnKind::Numeric,
                Value::Numeric(Decimal::from_str("12345.6789").unwrap()),
            ),
        ];
        for (kind, value) in cases {
            let json = value.to_serde_json_value();
            assert_eq!(Value::from_serde_json_value(&kind, &json), value);
        }
    }

    #[test]
    fn null_maps_to_null() {
        assert_eq!(
            Value::from_serde_json_value(&ColumnKind::Int64, &serde_json::Value::Null),
            Value::Null
        );
        assert_eq!(Value::Null.to_serde_json_value(), serde_json::Value::Null);
    }

    #[test]
    fn binary_encodes_as_base64() {
        let value = Value::Binary(Bytes::from_static(b"\x00\x01\x02"));
        let json = value.to_serde_json_value();
        assert_eq!(json, serde_json::Value::String("AAEC".to_owned()));
        assert_eq!(Value::from_serde_json_value(&ColumnKind::Bytes, &json), value);
    }

    #[test]
    fn empty_array_is_json_array() {
        let value = Value::Array(ArrayValue::Empty);
        assert_eq!(value.to_serde_json_value(), serde_json::json!([]));
    }
}
