//! Semantic field types and the typed value model.
//!
//! Raw records come off the readers as JSON values; validation coerces
//! them into [`FieldValue`]s according to the declared [`SemanticType`].
//! Adapters convert `FieldValue`s to driver-native bind parameters.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a source field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Date,
    Timestamp,
    Json,
}

impl SemanticType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticType::Integer => "integer",
            SemanticType::Float => "float",
            SemanticType::Decimal => "decimal",
            SemanticType::Boolean => "boolean",
            SemanticType::Text => "text",
            SemanticType::Date => "date",
            SemanticType::Timestamp => "timestamp",
            SemanticType::Json => "json",
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated, typed value ready for binding.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Float(f64),
    Decimal(Decimal),
    Boolean(bool),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Canonical string form used to build grain keys.
    ///
    /// Must agree with the SQL-side grain key expression the dialects
    /// generate (CAST to text, `|` separator), so the DLQ healing delete
    /// matches rows written by older loads.
    pub fn to_key_string(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Integer(v) => v.to_string(),
            FieldValue::Float(v) => v.to_string(),
            FieldValue::Decimal(v) => v.to_string(),
            FieldValue::Boolean(v) => v.to_string(),
            FieldValue::Text(v) => v.clone(),
            FieldValue::Date(v) => v.format("%Y-%m-%d").to_string(),
            FieldValue::Timestamp(v) => v.to_rfc3339(),
            FieldValue::Json(v) => v.to_string(),
        }
    }

    /// JSON representation, used when re-serialising rows for the DLQ.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Integer(v) => serde_json::Value::from(*v),
            FieldValue::Float(v) => serde_json::Value::from(*v),
            FieldValue::Decimal(v) => serde_json::Value::String(v.to_string()),
            FieldValue::Boolean(v) => serde_json::Value::from(*v),
            FieldValue::Text(v) => serde_json::Value::String(v.clone()),
            FieldValue::Date(v) => serde_json::Value::String(v.format("%Y-%m-%d").to_string()),
            FieldValue::Timestamp(v) => serde_json::Value::String(v.to_rfc3339()),
            FieldValue::Json(v) => v.clone(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("NULL"),
            other => f.write_str(&other.to_key_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_string_is_stable_for_grain_types() {
        assert_eq!(FieldValue::Integer(42).to_key_string(), "42");
        assert_eq!(FieldValue::Text("ab|c".into()).to_key_string(), "ab|c");
        assert_eq!(
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()).to_key_string(),
            "2024-03-01"
        );
    }
}
