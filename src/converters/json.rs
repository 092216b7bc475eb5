use serde_json::{json, Map, Value as JsonValue};

use crate::domain::{Row, Value};

pub fn json_to_value(val: &JsonValue) -> Result<Value, String> {
    match val {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Bool(b) => Ok(Value::Bool(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if n.is_u64() {
                Ok(Value::Numeric(n.to_string()))
            } else {
                n.as_f64()
                    .map(Value::Float)
                    .ok_or_else(|| format!("Unrepresentable number: {}", n))
            }
        }
        JsonValue::String(s) => Ok(Value::Text(s.clone())),
        JsonValue::Object(obj) => tagged_to_value(obj),
        JsonValue::Array(_) => Err("Arrays are not scalar values; write them as text".to_string()),
    }
}

fn tagged_to_value(obj: &Map<String, JsonValue>) -> Result<Value, String> {
    if obj.len() != 1 {
        return Err(format!(
            "Tagged value must have exactly one key, got {}",
            obj.len()
        ));
    }
    let Some((tag, inner)) = obj.iter().next() else {
        return Err("Empty tagged value".to_string());
    };
    match (tag.as_str(), inner) {
        ("numeric", JsonValue::String(s)) => Ok(Value::Numeric(s.clone())),
        ("numeric", JsonValue::Number(n)) => Ok(Value::Numeric(n.to_string())),
        ("float", JsonValue::Number(n)) => n
            .as_f64()
            .map(Value::Float)
            .ok_or_else(|| format!("Invalid float: {}", n)),
        ("float", JsonValue::String(s)) => parse_float(s).map(Value::Float),
        ("bytes", JsonValue::String(s)) => decode_hex(s).map(Value::Bytes),
        (tag, inner) => Err(format!("Unsupported tagged value {}: {}", tag, inner)),
    }
}

fn parse_float(s: &str) -> Result<f64, String> {
    match s {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        other => other
            .parse()
            .map_err(|_| format!("Invalid float: {}", other)),
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    let digits = s.strip_prefix("\\x").unwrap_or(s);
    if digits.len() % 2 != 0 {
        return Err(format!("Odd number of hex digits: {}", s));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            digits
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("Invalid hex: {}", s))
        })
        .collect()
}

pub fn value_to_json(val: &Value) -> JsonValue {
    match val {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(x) if x.is_finite() => json!(x),
        Value::Float(x) => {
            let text = if x.is_nan() {
                "NaN"
            } else if x.is_sign_positive() {
                "Infinity"
            } else {
                "-Infinity"
            };
            json!({ "float": text })
        }
        Value::Numeric(s) => json!({ "numeric": s }),
        Value::Text(s) => json!(s),
        Value::Bytes(b) => {
            let hex: String = b.iter().map(|byte| format!("{:02x}", byte)).collect();
            json!({ "bytes": format!("\\x{}", hex) })
        }
    }
}

pub fn json_to_row(val: &JsonValue) -> Result<Row, String> {
    match val {
        JsonValue::Array(cells) => cells.iter().map(json_to_value).collect(),
        other => Err(format!("Row must be an array, got {}", other)),
    }
}

impl TryFrom<JsonValue> for Value {
    type Error = String;

    fn try_from(val: JsonValue) -> Result<Self, Self::Error> {
        json_to_value(&val)
    }
}

impl From<Value> for JsonValue {
    fn from(val: Value) -> Self {
        value_to_json(&val)
    }
}
