//! Validation and type coercion from raw API records into [`CleanRecord`]s.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use thiserror::Error;

use crate::{CleanRecord, RawRecord, MAX_TEXT_LEN};

pub const REQUIRED_FIELDS: [&str; 6] = [
    "unique_key",
    "created_date",
    "complaint_type",
    "descriptor",
    "latitude",
    "longitude",
];

const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// The fetched payload lacks required columns altogether.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("missing required fields: {}", .missing.join(", "))]
pub struct SchemaError {
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanBatch {
    pub records: Vec<CleanRecord>,
    pub input_rows: usize,
    pub dropped_rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CleanOutcome {
    /// Nothing was fetched; the rest of the run must be skipped.
    Empty,
    Batch(CleanBatch),
}

/// A field counts as present when at least one record carries it, mirroring
/// a column in the tabular projection of the payload. Rows with a missing or
/// uncoercible value in any required field are dropped; order is preserved.
pub fn clean(records: &[RawRecord]) -> Result<CleanOutcome, SchemaError> {
    if records.is_empty() {
        return Ok(CleanOutcome::Empty);
    }

    let missing = REQUIRED_FIELDS
        .iter()
        .filter(|field| !records.iter().any(|r| r.contains_key(**field)))
        .map(|field| field.to_string())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(SchemaError { missing });
    }

    let cleaned = records.iter().filter_map(coerce_record).collect::<Vec<_>>();
    Ok(CleanOutcome::Batch(CleanBatch {
        input_rows: records.len(),
        dropped_rows: records.len() - cleaned.len(),
        records: cleaned,
    }))
}

fn coerce_record(raw: &RawRecord) -> Option<CleanRecord> {
    Some(CleanRecord {
        unique_key: raw.get("unique_key").and_then(coerce_i64)?,
        created_date: raw.get("created_date").and_then(coerce_timestamp)?,
        complaint_type: raw.get("complaint_type").and_then(coerce_text)?,
        descriptor: raw.get("descriptor").and_then(coerce_text)?,
        latitude: raw.get("latitude").and_then(coerce_f64)?,
        longitude: raw.get("longitude").and_then(coerce_f64)?,
    })
}

fn integral(value: f64) -> Option<i64> {
    // Anything beyond 2^63 cannot be a BIGINT key.
    (value.is_finite() && value.fract() == 0.0 && value.abs() < 9.2e18).then_some(value as i64)
}

fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(integral))
        }
        _ => None,
    }
}

fn coerce_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn coerce_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (text.chars().count() <= MAX_TEXT_LEN).then_some(text)
}

fn coerce_timestamp(value: &Value) -> Option<NaiveDateTime> {
    let text = value.as_str()?.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}
