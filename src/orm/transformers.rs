//! Column value transformers
//!
//! A transformer sits between the stored representation of a column and the
//! value exposed on the entity.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde_json::{Value as JsonValue, json};

use super::value::SqlValue;
use crate::error::{OrmError, Result};

/// Converts a column value in both directions.
pub trait ValueTransformer: Send + Sync {
    /// Name for debugging output
    fn name(&self) -> &'static str;

    /// Entity value to bindable database value
    fn to_database(&self, value: &JsonValue) -> Result<SqlValue>;

    /// Database value to entity value
    fn from_database(&self, value: &SqlValue) -> Result<JsonValue>;
}

/// Stores instants as INTEGER epoch milliseconds, exposes RFC 3339 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampTransformer;

impl ValueTransformer for TimestampTransformer {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn to_database(&self, value: &JsonValue) -> Result<SqlValue> {
        match value {
            JsonValue::Number(n) => n
                .as_i64()
                .map(SqlValue::Int)
                .ok_or_else(|| OrmError::mapping(format!("timestamp is not an integer: {}", n))),
            JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| SqlValue::Int(dt.timestamp_millis()))
                .map_err(|e| OrmError::mapping(format!("invalid timestamp '{}': {}", s, e))),
            other => Err(OrmError::mapping(format!("invalid timestamp value: {}", other))),
        }
    }

    fn from_database(&self, value: &SqlValue) -> Result<JsonValue> {
        let millis = value
            .as_i64()
            .ok_or_else(|| OrmError::mapping(format!("timestamp column holds {:?}", value)))?;
        let dt = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| OrmError::mapping(format!("timestamp out of range: {}", millis)))?;
        Ok(JsonValue::String(
            dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        ))
    }
}

/// Stores calendar days as `YYYY-MM-DD` text, exposes `{year, month, day}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DayTransformer;

impl DayTransformer {
    fn parse_struct(value: &JsonValue) -> Option<NaiveDate> {
        let year = value.get("year")?.as_i64()?;
        let month = value.get("month")?.as_u64()?;
        let day = value.get("day")?.as_u64()?;
        NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
    }
}

impl ValueTransformer for DayTransformer {
    fn name(&self) -> &'static str {
        "day"
    }

    fn to_database(&self, value: &JsonValue) -> Result<SqlValue> {
        let date = match value {
            JsonValue::Object(_) => Self::parse_struct(value),
            JsonValue::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok(),
            _ => None,
        }
        .ok_or_else(|| OrmError::mapping(format!("invalid day value: {}", value)))?;
        Ok(SqlValue::String(date.format("%Y-%m-%d").to_string()))
    }

    fn from_database(&self, value: &SqlValue) -> Result<JsonValue> {
        let text = value
            .as_str()
            .ok_or_else(|| OrmError::mapping(format!("day column holds {:?}", value)))?;
        let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map_err(|e| OrmError::mapping(format!("invalid day '{}': {}", text, e)))?;
        Ok(json!({
            "year": date.year(),
            "month": date.month(),
            "day": date.day(),
        }))
    }
}
