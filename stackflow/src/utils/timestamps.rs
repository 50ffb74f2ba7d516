//! Timestamp utilities.

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Errors that can occur during timestamp parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    /// The timestamp string is empty.
    #[error("Empty timestamp string")]
    EmptyString,

    /// The timestamp value is invalid.
    #[error("Invalid timestamp: {0}")]
    InvalidFormat(String),
}

/// Returns the current UTC time as an ISO 8601 formatted string.
///
/// # Examples
///
/// ```
/// use stackflow::utils::iso_timestamp;
///
/// let ts = iso_timestamp();
/// assert!(ts.contains('T'));
/// ```
#[must_use]
pub fn iso_timestamp() -> String {
    format_iso8601(&Utc::now())
}

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Formats a timestamp as ISO 8601 string.
#[must_use]
pub fn format_iso8601(dt: &Timestamp) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Parses the timestamp carried by an ingest notification.
///
/// Accepts RFC 3339 strings (`2024-01-01T00:00:00.000Z`) and Unix epochs in
/// seconds or milliseconds (13+ digits).
///
/// # Errors
///
/// Returns `TimestampError` if the input cannot be parsed.
pub fn parse_event_time(input: &str) -> Result<Timestamp, TimestampError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(TimestampError::EmptyString);
    }

    if let Ok(epoch) = trimmed.parse::<i64>() {
        let parsed = if trimmed.trim_start_matches('-').len() >= 13 {
            Utc.timestamp_millis_opt(epoch).single()
        } else {
            Utc.timestamp_opt(epoch, 0).single()
        };
        return parsed.ok_or_else(|| TimestampError::InvalidFormat(trimmed.to_string()));
    }

    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TimestampError::InvalidFormat(trimmed.to_string()))
}
