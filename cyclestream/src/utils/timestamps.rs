//! Timestamp helpers for derived columns.
//!
//! Feed payloads carry unix timestamps (usually seconds); derived columns are
//! rendered as RFC3339 UTC strings or `YYYY-MM-DD` dates.

use chrono::{DateTime, DurationRound, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Errors that can occur during timestamp parsing.
#[derive(Debug, Error)]
pub enum TimestampError {
    /// The input type is not supported.
    #[error("Unsupported timestamp type: expected string or number")]
    UnsupportedType,

    /// The timestamp string is empty.
    #[error("Empty timestamp string")]
    EmptyString,

    /// The timestamp value is invalid.
    #[error("Invalid timestamp: {0}")]
    InvalidFormat(String),

    /// Nanosecond precision is not supported.
    #[error("Nanosecond precision timestamps are not supported")]
    NanosecondPrecision,
}

/// Detected precision of a Unix timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnixPrecision {
    /// Seconds (<=10 digits)
    Seconds,
    /// Milliseconds (<=13 digits)
    Milliseconds,
    /// Microseconds (<=16 digits)
    Microseconds,
}

/// Detects the precision of a Unix timestamp based on digit count.
///
/// # Errors
///
/// Returns `TimestampError::NanosecondPrecision` if the timestamp has more than 16 digits.
pub fn detect_unix_precision(timestamp: f64) -> Result<UnixPrecision, TimestampError> {
    let int_part = timestamp.abs().trunc() as i64;
    let digit_count = if int_part == 0 {
        1
    } else {
        int_part.to_string().len()
    };

    match digit_count {
        0..=10 => Ok(UnixPrecision::Seconds),
        11..=13 => Ok(UnixPrecision::Milliseconds),
        14..=16 => Ok(UnixPrecision::Microseconds),
        _ => Err(TimestampError::NanosecondPrecision),
    }
}

/// Parses a Unix timestamp with automatic precision detection.
///
/// # Errors
///
/// Returns `TimestampError` if the value is out of range.
pub fn parse_unix_timestamp(value: f64) -> Result<Timestamp, TimestampError> {
    if !value.is_finite() {
        return Err(TimestampError::InvalidFormat(value.to_string()));
    }

    // Fractional values are always seconds
    if value.fract().abs() > f64::EPSILON {
        let secs = value.trunc() as i64;
        let nanos = (value.fract().abs() * 1_000_000_000.0) as u32;
        return Utc
            .timestamp_opt(secs, nanos)
            .single()
            .ok_or_else(|| TimestampError::InvalidFormat(value.to_string()));
    }

    let ts = value as i64;
    let (secs, nanos) = match detect_unix_precision(value)? {
        UnixPrecision::Seconds => (ts, 0),
        UnixPrecision::Milliseconds => (ts.div_euclid(1000), ts.rem_euclid(1000) * 1_000_000),
        UnixPrecision::Microseconds => (ts.div_euclid(1_000_000), ts.rem_euclid(1_000_000) * 1000),
    };

    Utc.timestamp_opt(secs, nanos as u32)
        .single()
        .ok_or_else(|| TimestampError::InvalidFormat(value.to_string()))
}

/// Parses a timestamp string: unix digits or ISO 8601 / RFC3339.
///
/// # Errors
///
/// Returns `TimestampError` if the input cannot be parsed.
pub fn parse_timestamp(input: &str) -> Result<Timestamp, TimestampError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(TimestampError::EmptyString);
    }

    if let Ok(num) = trimmed.parse::<f64>() {
        return parse_unix_timestamp(num);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    let formats = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];
    for fmt in formats {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(date) = chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(TimestampError::InvalidFormat(trimmed.to_string()))
}

/// Interprets a column value as a timestamp.
///
/// # Errors
///
/// Returns `TimestampError::UnsupportedType` for nulls, booleans and containers.
pub fn timestamp_from_value(value: &Value) -> Result<Timestamp, TimestampError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or(TimestampError::UnsupportedType)
            .and_then(parse_unix_timestamp),
        Value::String(s) => parse_timestamp(s),
        _ => Err(TimestampError::UnsupportedType),
    }
}

/// Formats a timestamp as RFC3339 with a `Z` suffix.
#[must_use]
pub fn format_timestamp(dt: &Timestamp) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
}

/// Returns the calendar date of a timestamp as `YYYY-MM-DD`.
#[must_use]
pub fn to_date_string(dt: &Timestamp) -> String {
    dt.format("%Y-%m-%d").to_string()
}

/// Truncates a timestamp to the start of its hour.
#[must_use]
pub fn truncate_to_hour(dt: &Timestamp) -> Timestamp {
    dt.duration_trunc(chrono::Duration::hours(1)).unwrap_or(*dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    #[test]
    fn test_detect_unix_precision() {
        assert_eq!(detect_unix_precision(1696512000.0).unwrap(), UnixPrecision::Seconds);
        assert_eq!(
            detect_unix_precision(1696512000000.0).unwrap(),
            UnixPrecision::Milliseconds
        );
        assert_eq!(
            detect_unix_precision(1696512000000000.0).unwrap(),
            UnixPrecision::Microseconds
        );
    }

    #[test]
    fn test_parse_unix_seconds_and_millis_agree() {
        let secs = parse_unix_timestamp(1_700_000_000.0).unwrap();
        let millis = parse_unix_timestamp(1_700_000_000_000.0).unwrap();
        assert_eq!(secs, millis);
    }

    #[test]
    fn test_timestamp_from_value() {
        let dt = timestamp_from_value(&json!(1_700_000_000)).unwrap();
        assert_eq!(format_timestamp(&dt), "2023-11-14T22:13:20Z");
        assert_eq!(to_date_string(&dt), "2023-11-14");

        let parsed = timestamp_from_value(&json!("2023-11-14T22:13:20Z")).unwrap();
        assert_eq!(parsed, dt);

        assert!(matches!(
            timestamp_from_value(&Value::Null),
            Err(TimestampError::UnsupportedType)
        ));
    }

    #[test]
    fn test_truncate_to_hour() {
        let dt = parse_timestamp("2023-11-14T22:13:20Z").unwrap();
        let hour = truncate_to_hour(&dt);
        assert_eq!(hour.hour(), 22);
        assert_eq!(hour.minute(), 0);
        assert_eq!(hour.second(), 0);
    }

    #[test]
    fn test_parse_date_only() {
        let dt = parse_timestamp("2024-02-29").unwrap();
        assert_eq!(dt.month(), 2);
        assert_eq!(dt.day(), 29);
    }

    #[test]
    fn test_parse_empty_string() {
        assert!(matches!(parse_timestamp("  "), Err(TimestampError::EmptyString)));
    }
}
