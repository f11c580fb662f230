//! Per-row validation.
//!
//! Coerces raw reader values into typed values per the source schema,
//! applies nullability and field rules, and runs the streaming grain
//! pre-check (first occurrence wins). Invalid rows become DLQ material;
//! they never abort the stream. The running invalid count backs the
//! threshold decision taken after end of stream.

use crate::failure::LoadFailure;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use fileflow_protocol::{
    FieldRule, FieldSchema, FieldValue, LoadErrorKind, RowRule, SemanticType, SourceConfig,
};
use fileflow_readers::Batch;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashSet;
use std::str::FromStr;

/// A row that passed validation, values in schema field order.
#[derive(Debug, Clone)]
pub struct TypedRow {
    pub row: u64,
    pub values: Vec<FieldValue>,
    pub grain_key: String,
}

/// A row that failed validation.
#[derive(Debug, Clone)]
pub struct RowFailure {
    pub row: u64,
    pub failed_fields: Vec<String>,
    pub reasons: Vec<String>,
    /// Present when the grain fields themselves validated.
    pub grain_key: Option<String>,
    pub original_row_json: String,
}

/// A batch split into its valid and invalid rows.
#[derive(Debug, Default)]
pub struct ValidatedBatch {
    pub valid: Vec<TypedRow>,
    pub invalid: Vec<RowFailure>,
}

enum CompiledRule {
    MinInt(i64),
    MaxInt(i64),
    MinFloat(f64),
    MaxFloat(f64),
    MinLen(usize),
    MaxLen(usize),
    Matches(Regex),
    OneOf(Vec<String>),
}

/// Streaming validator; strictly per-file state.
pub struct RowValidator {
    fields: Vec<FieldSchema>,
    rules: Vec<Vec<CompiledRule>>,
    row_rules: Vec<RowRule>,
    grain_indices: Vec<usize>,
    error_threshold: u64,
    seen_grains: HashSet<String>,
    pub rows_read: u64,
    pub invalid_count: u64,
    /// In-file grain repeats. Never tolerated by the error threshold;
    /// the file fails grain validation after the stream ends.
    pub grain_duplicates: u64,
    pub first_duplicate_key: Option<String>,
}

impl RowValidator {
    pub fn new(source: &SourceConfig) -> Result<Self, LoadFailure> {
        let mut rules = Vec::with_capacity(source.fields.len());
        for field in &source.fields {
            let mut compiled = Vec::with_capacity(field.rules.len());
            for rule in &field.rules {
                compiled.push(match rule {
                    FieldRule::MinInt { value } => CompiledRule::MinInt(*value),
                    FieldRule::MaxInt { value } => CompiledRule::MaxInt(*value),
                    FieldRule::MinFloat { value } => CompiledRule::MinFloat(*value),
                    FieldRule::MaxFloat { value } => CompiledRule::MaxFloat(*value),
                    FieldRule::MinLen { value } => CompiledRule::MinLen(*value),
                    FieldRule::MaxLen { value } => CompiledRule::MaxLen(*value),
                    FieldRule::Matches { pattern } => {
                        CompiledRule::Matches(Regex::new(pattern).map_err(|e| {
                            LoadFailure::new(
                                LoadErrorKind::ConfigError,
                                format!("field '{}': {}", field.name, e),
                            )
                        })?)
                    }
                    FieldRule::OneOf { values } => CompiledRule::OneOf(values.clone()),
                });
            }
            rules.push(compiled);
        }
        Ok(Self {
            fields: source.fields.clone(),
            rules,
            row_rules: source.row_rules.clone(),
            grain_indices: source.grain_indices(),
            error_threshold: source.error_threshold,
            seen_grains: HashSet::new(),
            rows_read: 0,
            invalid_count: 0,
            grain_duplicates: 0,
            first_duplicate_key: None,
        })
    }

    /// True once the invalid count exceeds the configured threshold.
    /// The stream is still read to completion so the DLQ is complete.
    pub fn threshold_exceeded(&self) -> bool {
        self.invalid_count > self.error_threshold
    }

    pub fn validate_batch(&mut self, batch: Batch) -> ValidatedBatch {
        let mut out = ValidatedBatch::default();
        for record in batch.records {
            self.rows_read += 1;
            let row = record.row;
            let original_row_json = Value::Object(record.values.clone()).to_string();

            let mut values = Vec::with_capacity(self.fields.len());
            let mut failed_fields = Vec::new();
            let mut reasons = Vec::new();
            for (index, field) in self.fields.iter().enumerate() {
                let raw = record.values.get(&field.name).unwrap_or(&Value::Null);
                let typed = match coerce(raw, field.field_type) {
                    Ok(FieldValue::Null) if !field.nullable => {
                        Err("must not be null".to_string())
                    }
                    Ok(value) => check_rules(&self.rules[index], &value).map(|_| value),
                    Err(message) => Err(message),
                };
                match typed {
                    Ok(value) => values.push(value),
                    Err(message) => {
                        failed_fields.push(field.name.clone());
                        reasons.push(format!("{}: {}", field.name, message));
                        values.push(FieldValue::Null);
                    }
                }
            }

            // Cross-field rules run only once every field coerced cleanly.
            if failed_fields.is_empty() {
                for rule in &self.row_rules {
                    if let Err((fields, reason)) = check_row_rule(rule, &self.fields, &values) {
                        failed_fields.extend(fields);
                        reasons.push(reason);
                    }
                }
            }

            let grain_ok = self
                .grain_indices
                .iter()
                .all(|i| !failed_fields.contains(&self.fields[*i].name));
            let grain_key = grain_ok.then(|| {
                self.grain_indices
                    .iter()
                    .map(|i| values[*i].to_key_string())
                    .collect::<Vec<_>>()
                    .join("|")
            });

            match grain_key {
                Some(key) if failed_fields.is_empty() => {
                    if self.seen_grains.insert(key.clone()) {
                        out.valid.push(TypedRow {
                            row,
                            values,
                            grain_key: key,
                        });
                    } else {
                        // First occurrence wins; the repeat goes to the DLQ.
                        self.invalid_count += 1;
                        self.grain_duplicates += 1;
                        if self.first_duplicate_key.is_none() {
                            self.first_duplicate_key = Some(key.clone());
                        }
                        let grain_fields: Vec<String> = self
                            .grain_indices
                            .iter()
                            .map(|i| self.fields[*i].name.clone())
                            .collect();
                        out.invalid.push(RowFailure {
                            row,
                            reasons: vec![format!(
                                "DuplicateGrain: key '{}' repeats within the file",
                                key
                            )],
                            failed_fields: grain_fields,
                            grain_key: Some(key),
                            original_row_json,
                        });
                    }
                }
                grain_key => {
                    self.invalid_count += 1;
                    out.invalid.push(RowFailure {
                        row,
                        failed_fields,
                        reasons,
                        grain_key,
                        original_row_json,
                    });
                }
            }
        }
        out
    }
}

fn check_row_rule(
    rule: &RowRule,
    fields: &[FieldSchema],
    values: &[FieldValue],
) -> Result<(), (Vec<String>, String)> {
    let value_of = |name: &String| {
        fields
            .iter()
            .position(|f| &f.name == name)
            .map(|i| &values[i])
    };
    match rule {
        RowRule::OrderedPair { left, right } => {
            let (Some(a), Some(b)) = (value_of(left), value_of(right)) else {
                return Ok(());
            };
            if a.is_null() || b.is_null() {
                return Ok(());
            }
            let ordered = match (as_f64(a), as_f64(b)) {
                (Some(a), Some(b)) => a <= b,
                _ => a.to_key_string() <= b.to_key_string(),
            };
            if !ordered {
                return Err((
                    vec![left.clone(), right.clone()],
                    format!("{}: '{}' exceeds {} '{}'", left, a, right, b),
                ));
            }
            Ok(())
        }
        RowRule::AnyPresent { fields: names } => {
            let all_null = names
                .iter()
                .all(|name| value_of(name).map(|v| v.is_null()).unwrap_or(true));
            if all_null {
                return Err((
                    names.clone(),
                    format!("at least one of {:?} must be present", names),
                ));
            }
            Ok(())
        }
    }
}

fn check_rules(rules: &[CompiledRule], value: &FieldValue) -> Result<(), String> {
    if value.is_null() {
        return Ok(());
    }
    for rule in rules {
        match (rule, value) {
            (CompiledRule::MinInt(min), FieldValue::Integer(v)) if v < min => {
                return Err(format!("{} is below minimum {}", v, min));
            }
            (CompiledRule::MaxInt(max), FieldValue::Integer(v)) if v > max => {
                return Err(format!("{} is above maximum {}", v, max));
            }
            (CompiledRule::MinFloat(min), _) => {
                if let Some(v) = as_f64(value) {
                    if v < *min {
                        return Err(format!("{} is below minimum {}", v, min));
                    }
                }
            }
            (CompiledRule::MaxFloat(max), _) => {
                if let Some(v) = as_f64(value) {
                    if v > *max {
                        return Err(format!("{} is above maximum {}", v, max));
                    }
                }
            }
            (CompiledRule::MinLen(min), FieldValue::Text(s)) if s.chars().count() < *min => {
                return Err(format!("length {} is below minimum {}", s.chars().count(), min));
            }
            (CompiledRule::MaxLen(max), FieldValue::Text(s)) if s.chars().count() > *max => {
                return Err(format!("length {} is above maximum {}", s.chars().count(), max));
            }
            (CompiledRule::Matches(re), FieldValue::Text(s)) if !re.is_match(s) => {
                return Err(format!("'{}' does not match /{}/", s, re.as_str()));
            }
            (CompiledRule::OneOf(allowed), value) => {
                let key = value.to_key_string();
                if !allowed.contains(&key) {
                    return Err(format!("'{}' is not one of {:?}", key, allowed));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn as_f64(value: &FieldValue) -> Option<f64> {
    use rust_decimal::prelude::ToPrimitive;
    match value {
        FieldValue::Integer(v) => Some(*v as f64),
        FieldValue::Float(v) => Some(*v),
        FieldValue::Decimal(v) => v.to_f64(),
        _ => None,
    }
}

/// Coerce one raw JSON value into the declared semantic type.
pub fn coerce(raw: &Value, semantic: SemanticType) -> Result<FieldValue, String> {
    match raw {
        Value::Null => return Ok(FieldValue::Null),
        // Blank cells are nulls; readers hand CSV cells through as-is.
        Value::String(s) if s.trim().is_empty() => return Ok(FieldValue::Null),
        _ => {}
    }

    match semantic {
        SemanticType::Integer => match raw {
            Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Ok(FieldValue::Integer(v))
                } else if let Some(f) = n.as_f64().filter(|f| f.fract() == 0.0) {
                    Ok(FieldValue::Integer(f as i64))
                } else {
                    Err(format!("'{}' is not an integer", n))
                }
            }
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(FieldValue::Integer)
                .map_err(|_| format!("'{}' is not an integer", s)),
            other => Err(format!("'{}' is not an integer", other)),
        },
        SemanticType::Float => match raw {
            Value::Number(n) => n
                .as_f64()
                .map(FieldValue::Float)
                .ok_or_else(|| format!("'{}' is not a number", n)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(FieldValue::Float)
                .map_err(|_| format!("'{}' is not a number", s)),
            other => Err(format!("'{}' is not a number", other)),
        },
        SemanticType::Decimal => match raw {
            Value::Number(n) => Decimal::from_str(&n.to_string())
                .map(FieldValue::Decimal)
                .map_err(|_| format!("'{}' is not a decimal", n)),
            Value::String(s) => Decimal::from_str(s.trim())
                .map(FieldValue::Decimal)
                .map_err(|_| format!("'{}' is not a decimal", s)),
            other => Err(format!("'{}' is not a decimal", other)),
        },
        SemanticType::Boolean => match raw {
            Value::Bool(b) => Ok(FieldValue::Boolean(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(FieldValue::Boolean(false)),
                Some(1) => Ok(FieldValue::Boolean(true)),
                _ => Err(format!("'{}' is not a boolean", n)),
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" | "y" => Ok(FieldValue::Boolean(true)),
                "false" | "f" | "0" | "no" | "n" => Ok(FieldValue::Boolean(false)),
                _ => Err(format!("'{}' is not a boolean", s)),
            },
            other => Err(format!("'{}' is not a boolean", other)),
        },
        SemanticType::Text => match raw {
            Value::String(s) => Ok(FieldValue::Text(s.clone())),
            Value::Number(n) => Ok(FieldValue::Text(n.to_string())),
            Value::Bool(b) => Ok(FieldValue::Text(b.to_string())),
            other => Err(format!("'{}' is not text", other)),
        },
        SemanticType::Date => match raw {
            Value::String(s) => parse_date(s.trim()).ok_or_else(|| format!("'{}' is not a date", s)),
            other => Err(format!("'{}' is not a date", other)),
        },
        SemanticType::Timestamp => match raw {
            Value::String(s) => {
                parse_timestamp(s.trim()).ok_or_else(|| format!("'{}' is not a timestamp", s))
            }
            other => Err(format!("'{}' is not a timestamp", other)),
        },
        SemanticType::Json => Ok(FieldValue::Json(raw.clone())),
    }
}

fn parse_date(s: &str) -> Option<FieldValue> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(FieldValue::Date(date));
    }
    // Datetime strings truncate to their date part.
    parse_timestamp(s).map(|ts| match ts {
        FieldValue::Timestamp(dt) => FieldValue::Date(dt.date_naive()),
        other => other,
    })
}

fn parse_timestamp(s: &str) -> Option<FieldValue> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(FieldValue::Timestamp(dt.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(FieldValue::Timestamp(naive.and_utc()));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|date| FieldValue::Timestamp(date.and_time(chrono::NaiveTime::MIN).and_utc()))
}
