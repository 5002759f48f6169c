//! JSON scalar to attribute value conversion

use crate::core::{AttributeType, DaoError, Result, Value};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::str::FromStr;

/// Converts JSON scalars to store values of a declared attribute type
pub struct JsonToValueConverter;

impl JsonToValueConverter {
    pub fn convert(json_value: &JsonValue, expected_type: AttributeType) -> Result<Value> {
        match (json_value, expected_type) {
            (JsonValue::Null, _) => Ok(Value::Null),

            (v, AttributeType::Json) => Ok(Value::Json(v.clone())),

            (JsonValue::Bool(b), AttributeType::Boolean) => Ok(Value::Boolean(*b)),

            // Integral floats such as 3.0 are accepted
            (JsonValue::Number(n), AttributeType::Integer) => n
                .as_i64()
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                })
                .map(Value::Integer)
                .ok_or_else(|| mismatch(json_value, expected_type)),

            (JsonValue::Number(n), AttributeType::Float) => n
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| mismatch(json_value, expected_type)),

            (JsonValue::Number(n), AttributeType::Decimal) => parse_decimal(&n.to_string())
                .map(Value::Decimal)
                .ok_or_else(|| mismatch(json_value, expected_type)),

            // Decimal amounts often travel as strings to keep their precision
            (JsonValue::String(s), AttributeType::Decimal) => parse_decimal(s)
                .map(Value::Decimal)
                .ok_or_else(|| mismatch(json_value, expected_type)),

            (JsonValue::String(s), AttributeType::Text) => Ok(Value::Text(s.clone())),

            (JsonValue::Number(_) | JsonValue::Bool(_), AttributeType::Text) => {
                Ok(Value::Text(json_value.to_string()))
            }

            (JsonValue::String(s), AttributeType::Timestamp) => {
                let dt = chrono::DateTime::parse_from_rfc3339(s)
                    .map_err(|e| DaoError::TypeMismatch(format!("Invalid timestamp: {}", e)))?;
                Ok(Value::Timestamp(dt.with_timezone(&chrono::Utc)))
            }

            // Unix seconds
            (JsonValue::Number(n), AttributeType::Timestamp) => n
                .as_i64()
                .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
                .map(Value::Timestamp)
                .ok_or_else(|| mismatch(json_value, expected_type)),

            (JsonValue::String(s), AttributeType::Date) => {
                let d = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map_err(|e| DaoError::TypeMismatch(format!("Invalid date: {}", e)))?;
                Ok(Value::Date(d))
            }

            (JsonValue::String(s), AttributeType::Uuid) => {
                let u = uuid::Uuid::parse_str(s)
                    .map_err(|e| DaoError::TypeMismatch(format!("Invalid UUID: {}", e)))?;
                Ok(Value::Uuid(u))
            }

            _ => Err(mismatch(json_value, expected_type)),
        }
    }
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

fn mismatch(json_value: &JsonValue, expected_type: AttributeType) -> DaoError {
    DaoError::TypeMismatch(format!(
        "Cannot convert JSON {} to {}",
        json_value, expected_type
    ))
}
