//! Mapping between Postgres types and the generic column model.

use chrono::NaiveDateTime;
use pt::ColumnKind;
use rust_decimal::Decimal;
use std::str::FromStr;
use tokio_postgres::types::Type;
use value::{array::ArrayValue, Value};

/// Map a Postgres type OID to a generic column kind. Types outside the
/// generic model decay to strings.
pub fn column_kind_from_oid(oid: u32) -> ColumnKind {
    match oid {
        16 => ColumnKind::Bool,
        21 | 23 => ColumnKind::Int32,
        20 | 26 => ColumnKind::Int64,
        700 => ColumnKind::Float32,
        701 => ColumnKind::Float64,
        1700 => ColumnKind::Numeric,
        17 => ColumnKind::Bytes,
        114 | 3802 => ColumnKind::Json,
        1114 | 1184 => ColumnKind::Timestamp,
        1000 => ColumnKind::Array(Box::new(ColumnKind::Bool)),
        1005 | 1007 => ColumnKind::Array(Box::new(ColumnKind::Int32)),
        1016 => ColumnKind::Array(Box::new(ColumnKind::Int64)),
        1021 => ColumnKind::Array(Box::new(ColumnKind::Float32)),
        1022 => ColumnKind::Array(Box::new(ColumnKind::Float64)),
        1009 | 1015 => ColumnKind::Array(Box::new(ColumnKind::String)),
        _ => ColumnKind::String,
    }
}

/// Parse the text representation pgoutput puts on the wire into a typed
/// value. Unparseable values decay to text rather than failing the batch.
pub fn parse_text_value(kind: &ColumnKind, text: &str) -> Value {
    match kind {
        ColumnKind::Bool => match text {
            "t" | "true" => Value::Bool(true),
            "f" | "false" => Value::Bool(false),
            _ => Value::Text(text.to_owned()),
        },
        ColumnKind::Int32 => text
            .parse::<i32>()
            .map(Value::Integer)
            .unwrap_or_else(|_| Value::Text(text.to_owned())),
        ColumnKind::Int64 => text
            .parse::<i64>()
            .map(Value::BigInt)
            .unwrap_or_else(|_| Value::Text(text.to_owned())),
        ColumnKind::Float32 => text
            .parse::<f32>()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::Text(text.to_owned())),
        ColumnKind::Float64 => text
            .parse::<f64>()
            .map(Value::Double)
            .unwrap_or_else(|_| Value::Text(text.to_owned())),
        ColumnKind::Numeric => Decimal::from_str(text)
            .map(Value::Numeric)
            .unwrap_or_else(|_| Value::Text(text.to_owned())),
        ColumnKind::Timestamp => parse_pg_timestamp(text)
            .map(Value::Timestamp)
            .unwrap_or_else(|| Value::Text(text.to_owned())),
        ColumnKind::Bytes => {
            // bytea text format is \x-prefixed hex
            if let Some(hex) = text.strip_prefix("\\x") {
                if let Ok(bytes) = decode_hex(hex) {
                    return Value::Binary(bytes.into());
                }
            }
            Value::Text(text.to_owned())
        }
        ColumnKind::Json => serde_json::from_str(text)
            .map(Value::Json)
            .unwrap_or_else(|_| Value::Text(text.to_owned())),
        ColumnKind::Array(inner) => parse_text_array(inner, text),
        ColumnKind::String => Value::Text(text.to_owned()),
    }
}

fn parse_pg_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z"))
        .ok()
}

fn decode_hex(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

fn parse_text_array(inner: &ColumnKind, text: &str) -> Value {
    let trimmed = text.trim_start_matches('{').trim_end_matches('}');
    if trimmed.is_empty() {
        return Value::Array(ArrayValue::Empty);
    }
    let elements: Vec<&str> = trimmed.split(',').collect();
    match inner {
        ColumnKind::Int32 => Value::Array(ArrayValue::Integer(
            elements.iter().filter_map(|e| e.parse().ok()).collect(),
        )),
        ColumnKind::Int64 => Value::Array(ArrayValue::BigInt(
            elements.iter().filter_map(|e| e.parse().ok()).collect(),
        )),
        ColumnKind::Float32 => Value::Array(ArrayValue::Float(
            elements.iter().filter_map(|e| e.parse().ok()).collect(),
        )),
        ColumnKind::Float64 => Value::Array(ArrayValue::Double(
            elements.iter().filter_map(|e| e.parse().ok()).collect(),
        )),
        ColumnKind::Bool => Value::Array(ArrayValue::Bool(
            elements.iter().map(|e| *e == "t" || *e == "true").collect(),
        )),
        _ => Value::Array(ArrayValue::Text(
            elements
                .iter()
                .map(|e| e.trim_matches('"').to_owned())
                .collect(),
        )),
    }
}

/// Read one cell of a query result row into a typed value. Dispatch is
/// on the type OID; anything outside the generic model is read as text.
pub fn value_from_row(
    row: &tokio_postgres::Row,
    idx: usize,
    pg_type: &Type,
) -> anyhow::Result<Value> {
    let value = match pg_type.oid() {
        16 => row
            .try_get::<_, Option<bool>>(idx)?
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        21 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| Value::Integer(v as i32))
            .unwrap_or(Value::Null),
        23 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(Value::Integer)
            .unwrap_or(Value::Null),
        20 => row
            .try_get::<_, Option<i64>>(idx)?
            .map(Value::BigInt)
            .unwrap_or(Value::Null),
        700 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(Value::Float)
            .unwrap_or(Value::Null),
        701 => row
            .try_get::<_, Option<f64>>(idx)?
            .map(Value::Double)
            .unwrap_or(Value::Null),
        1700 => row
            .try_get::<_, Option<Decimal>>(idx)?
            .map(Value::Numeric)
            .unwrap_or(Value::Null),
        17 => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map(|b| Value::Binary(b.into()))
            .unwrap_or(Value::Null),
        114 | 3802 => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(Value::Json)
            .unwrap_or(Value::Null),
        1114 => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        1184 => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
            .map(|ts| Value::Timestamp(ts.naive_utc()))
            .unwrap_or(Value::Null),
        1007 => row
            .try_get::<_, Option<Vec<i32>>>(idx)?
            .map(|v| Value::Array(ArrayValue::Integer(v)))
            .unwrap_or(Value::Null),
        1016 => row
            .try_get::<_, Option<Vec<i64>>>(idx)?
            .map(|v| Value::Array(ArrayValue::BigInt(v)))
            .unwrap_or(Value::Null),
        1009 | 1015 => row
            .try_get::<_, Option<Vec<String>>>(idx)?
            .map(|v| Value::Array(ArrayValue::Text(v)))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .unwrap_or(None)
            .map(Value::Text)
            .unwrap_or(Value::Null),
    };
    Ok(value)
}

/// Generic kind for a result column, used to announce the stream schema.
pub fn column_kind_from_pg_type(pg_type: &Type) -> ColumnKind {
    column_kind_from_oid(pg_type.oid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_mapping_covers_core_types() {
        assert_eq!(column_kind_from_oid(16), ColumnKind::Bool);
        assert_eq!(column_kind_from_oid(23), ColumnKind::Int32);
        assert_eq!(column_kind_from_oid(20), ColumnKind::Int64);
        assert_eq!(column_kind_from_oid(25), ColumnKind::String);
        assert_eq!(column_kind_from_oid(1700), ColumnKind::Numeric);
        assert_eq!(
            column_kind_from_oid(1007),
            ColumnKind::Array(Box::new(ColumnKind::Int32))
        );
        // unknown types decay to string
        assert_eq!(column_kind_from_oid(600), ColumnKind::String);
    }

    #[test]
    fn parses_wire_text() {
        assert_eq!(parse_text_value(&ColumnKind::Bool, "t"), Value::Bool(true));
        assert_eq!(
            parse_text_value(&ColumnKind::Int32, "42"),
            Value::Integer(42)
        );
        assert_eq!(
            parse_text_value(&ColumnKind::Bytes, "\\x0001"),
            Value::Binary(vec![0u8, 1u8].into())
        );
        assert_eq!(
            parse_text_value(&ColumnKind::Json, r#"{"a":1}"#),
            Value::Json(serde_json::json!({"a": 1}))
        );
        assert_eq!(
            parse_text_value(
                &ColumnKind::Timestamp,
                "2023-09-14 10:30:00.123456"
            ),
            Value::Timestamp(
                NaiveDateTime::parse_from_str(
                    "2023-09-14 10:30:00.123456",
                    "%Y-%m-%d %H:%M:%S%.f"
                )
                .unwrap()
            )
        );
    }

    #[test]
    fn parses_arrays() {
        assert_eq!(
            parse_text_value(&ColumnKind::Array(Box::new(ColumnKind::Int32)), "{1,2,3}"),
            Value::Array(ArrayValue::Integer(vec![1, 2, 3]))
        );
        assert_eq!(
            parse_text_value(&ColumnKind::Array(Box::new(ColumnKind::String)), "{}"),
            Value::Array(ArrayValue::Empty)
        );
    }

    #[test]
    fn malformed_values_decay_to_text() {
        assert_eq!(
            parse_text_value(&ColumnKind::Int32, "not-a-number"),
            Value::Text("not-a-number".to_owned())
        );
    }
}
