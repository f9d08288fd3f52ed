use chrono::NaiveDateTime;

#[derive(Debug, PartialEq, Clone)]
pub enum ArrayValue {
    Empty,
    Bool(Vec<bool>),
    Integer(Vec<i32>),
    BigInt(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Text(Vec<String>),
    Timestamp(Vec<NaiveDateTime>),
}

impl ArrayValue {
    pub fn to_serde_json_value(&self) -> serde_json::Value {
        match self {
            ArrayValue::Empty => serde_json::Value::Array(vec![]),
            ArrayValue::Bool(arr) => {
                serde_json::Value::Array(arr.iter().map(|&v| serde_json::Value::Bool(v)).collect())
            }
            ArrayValue::Integer(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|&v| serde_json::Value::Number(v.into()))
                    .collect(),
            ),
            ArrayValue::BigInt(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|&v| serde_json::Value::Number(v.into()))
                    .collect(),
            ),
            ArrayValue::Float(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|&v| {
                        serde_json::Number::from_f64(f64::from(v))
                            .map(serde_json::Value::Number)
                            .unwrap_or(serde_json::Value::Null)
                    })
                    .collect(),
            ),
            ArrayValue::Double(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|&v| {
                        serde_json::Number::from_f64(v)
                            .map(serde_json::Value::Number)
                            .unwrap_or(serde_json::Value::Null)
                    })
                    .collect(),
            ),
            ArrayValue::Text(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|v| serde_json::Value::String(v.clone()))
                    .collect(),
            ),
            ArrayValue::Timestamp(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|v| serde_json::Value::String(v.to_string()))
                    .collect(),
            ),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayValue::Empty => 0,
            ArrayValue::Bool(arr) => arr.len(),
            ArrayValue::Integer(arr) => arr.len(),
            ArrayValue::BigInt(arr) => arr.len(),
            ArrayValue::Float(arr) => arr.len(),
            ArrayValue::Double(arr) => arr.len(),
            ArrayValue::Text(arr) => arr.len(),
            ArrayValue::Timestamp(arr) => arr.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
