use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::table::Value;

/// Backend-agnostic type vocabulary used for casts and default values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    #[default]
    Text,
    Integer,
    Long,
    Decimal,
    Float,
    Double,
    Boolean,
    Timestamp,
    UniqueId,
}

impl LogicalType {
    /// Resolves a type name case-insensitively. Unknown or blank names are text.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "int" | "integer" => LogicalType::Integer,
            "bigint" | "long" => LogicalType::Long,
            "decimal" | "numeric" => LogicalType::Decimal,
            "float" | "real" => LogicalType::Float,
            "double" => LogicalType::Double,
            "boolean" | "bool" => LogicalType::Boolean,
            "datetime" | "timestamp" => LogicalType::Timestamp,
            "unique-id" | "guid" | "uuid" => LogicalType::UniqueId,
            _ => LogicalType::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalType::Text => "text",
            LogicalType::Integer => "integer",
            LogicalType::Long => "long",
            LogicalType::Decimal => "decimal",
            LogicalType::Float => "float",
            LogicalType::Double => "double",
            LogicalType::Boolean => "boolean",
            LogicalType::Timestamp => "timestamp",
            LogicalType::UniqueId => "unique-id",
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot convert '{value}' to {logical_type}: {reason}")]
pub struct CoercionError {
    pub value: String,
    pub logical_type: LogicalType,
    pub reason: String,
}

impl CoercionError {
    fn new(value: impl Into<String>, logical_type: LogicalType, reason: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            logical_type,
            reason: reason.into(),
        }
    }
}

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parses raw text (typically a field mapping's default value) into `target`.
pub fn coerce(raw: &str, target: LogicalType) -> Result<Value, CoercionError> {
    let trimmed = raw.trim();
    let fail = |reason: String| CoercionError::new(raw, target, reason);

    match target {
        LogicalType::Text => Ok(Value::Text(raw.to_string())),
        LogicalType::Integer => trimmed
            .parse::<i32>()
            .map(Value::Integer)
            .map_err(|err| fail(err.to_string())),
        LogicalType::Long => trimmed
            .parse::<i64>()
            .map(Value::Long)
            .map_err(|err| fail(err.to_string())),
        LogicalType::Decimal => Decimal::from_str(trimmed)
            .or_else(|_| Decimal::from_scientific(trimmed))
            .map(Value::Decimal)
            .map_err(|err| fail(err.to_string())),
        LogicalType::Float => trimmed
            .parse::<f32>()
            .map(Value::Float)
            .map_err(|err| fail(err.to_string())),
        LogicalType::Double => trimmed
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|err| fail(err.to_string())),
        LogicalType::Boolean => parse_bool(trimmed)
            .map(Value::Boolean)
            .ok_or_else(|| fail("expected true/false, yes/no or 1/0".to_string())),
        LogicalType::Timestamp => parse_timestamp(trimmed)
            .map(Value::Timestamp)
            .ok_or_else(|| fail("unrecognised date/time format".to_string())),
        LogicalType::UniqueId => Uuid::parse_str(trimmed)
            .map(Value::UniqueId)
            .map_err(|err| fail(err.to_string())),
    }
}

/// Converts an already-typed value into the representation bound for a
/// column of `target`. Null stays null.
pub fn conform(value: Value, target: LogicalType) -> Result<Value, CoercionError> {
    if value.is_null() || value.logical_type() == Some(target) {
        return Ok(value);
    }

    if target == LogicalType::Text {
        return Ok(Value::Text(value.render()));
    }

    if let Value::Text(text) = &value {
        return coerce(text, target);
    }

    let fail = |reason: &str| CoercionError::new(value.render(), target, reason);

    match target {
        LogicalType::Integer => integral(&value)
            .and_then(|v| i32::try_from(v).ok())
            .map(Value::Integer)
            .ok_or_else(|| fail("not an integer in 32-bit range")),
        LogicalType::Long => integral(&value)
            .map(Value::Long)
            .ok_or_else(|| fail("not an integer in 64-bit range")),
        LogicalType::Decimal => as_decimal(&value)
            .map(Value::Decimal)
            .ok_or_else(|| fail("not representable as a decimal")),
        LogicalType::Float => as_f64(&value)
            .map(|v| Value::Float(v as f32))
            .ok_or_else(|| fail("not a number")),
        LogicalType::Double => as_f64(&value)
            .map(Value::Double)
            .ok_or_else(|| fail("not a number")),
        LogicalType::Boolean => as_f64(&value)
            .map(|v| Value::Boolean(v != 0.0))
            .ok_or_else(|| fail("not a boolean")),
        LogicalType::Timestamp => Err(fail("not a date/time")),
        LogicalType::UniqueId => Err(fail("not a unique identifier")),
        LogicalType::Text => Ok(Value::Text(value.render())),
    }
}

fn integral(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(v) => Some(i64::from(*v)),
        Value::Long(v) => Some(*v),
        Value::Boolean(v) => Some(i64::from(*v)),
        Value::Decimal(v) if v.fract().is_zero() => v.to_i64(),
        Value::Float(v) if v.fract() == 0.0 => f64::from(*v).to_i64(),
        Value::Double(v) if v.fract() == 0.0 => v.to_i64(),
        _ => None,
    }
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Integer(v) => Some(Decimal::from(*v)),
        Value::Long(v) => Some(Decimal::from(*v)),
        Value::Boolean(v) => Some(Decimal::from(u8::from(*v))),
        Value::Decimal(v) => Some(*v),
        Value::Float(v) => Decimal::from_f32(*v),
        Value::Double(v) => Decimal::from_f64(*v),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(v) => Some(f64::from(*v)),
        Value::Long(v) => Some(*v as f64),
        Value::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
        Value::Decimal(v) => v.to_f64(),
        Value::Float(v) => Some(f64::from(*v)),
        Value::Double(v) => Some(*v),
        _ => None,
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(text) {
        return Some(with_offset.naive_utc());
    }

    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(|date| date.and_time(NaiveTime::MIN))
        })
}
