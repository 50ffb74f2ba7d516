//! Ingest notifications.

use crate::errors::StackflowError;
use crate::utils::{fingerprint, parse_event_time, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An object-created notification for the ingest bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestEvent {
    /// Bucket (or container) the object was written to.
    #[serde(rename = "bucketOrContainerId")]
    pub bucket: String,
    /// Object key, already URL-decoded.
    #[serde(rename = "objectKey")]
    pub key: String,
    /// When the object was written.
    #[serde(rename = "eventTimestamp")]
    pub event_time: Timestamp,
    /// Delivery-independent id used for deduplication.
    #[serde(rename = "eventId")]
    pub event_id: String,
}

impl IngestEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        event_time: Timestamp,
        event_id: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            event_time,
            event_id: event_id.into(),
        }
    }

    /// Parses every record of an object-store notification.
    ///
    /// Records look like `{"eventTime": .., "s3": {"bucket": {"name": ..},
    /// "object": {"key": .., "sequencer": ..}}}`. Keys arrive URL-encoded with
    /// `+` for spaces. The event id is derived from bucket, key and the
    /// sequencer (or the event time when there is none), so redelivery of
    /// the same write yields the same id.
    ///
    /// # Errors
    ///
    /// Returns [`StackflowError::InvalidEvent`] if the document has no
    /// `Records` array or a record is missing a required field.
    pub fn from_notification(notification: &Value) -> Result<Vec<Self>, StackflowError> {
        let records = notification
            .get("Records")
            .and_then(Value::as_array)
            .ok_or_else(|| StackflowError::InvalidEvent("notification has no Records array".to_string()))?;

        records
            .iter()
            .enumerate()
            .map(|(i, record)| Self::from_record(i, record))
            .collect()
    }

    fn from_record(index: usize, record: &Value) -> Result<Self, StackflowError> {
        let field = |pointer: &str| {
            record
                .pointer(pointer)
                .and_then(Value::as_str)
                .ok_or_else(|| StackflowError::InvalidEvent(format!("record {index} has no {pointer}")))
        };

        let bucket = field("/s3/bucket/name")?;
        let raw_key = field("/s3/object/key")?;
        let event_time_raw = field("/eventTime")?;
        let event_time = parse_event_time(event_time_raw)
            .map_err(|e| StackflowError::InvalidEvent(format!("record {index}: {e}")))?;

        let key = urlencoding::decode(&raw_key.replace('+', " "))
            .map_err(|e| StackflowError::InvalidEvent(format!("record {index} key is not valid UTF-8: {e}")))?
            .into_owned();

        let sequencer = record
            .pointer("/s3/object/sequencer")
            .and_then(Value::as_str)
            .unwrap_or(event_time_raw);
        let event_id = fingerprint(format!("{bucket}/{key}/{sequencer}").as_bytes());

        Ok(Self {
            bucket: bucket.to_string(),
            key,
            event_time,
            event_id,
        })
    }

    /// The execution input built from this event.
    #[must_use]
    pub fn execution_input(&self) -> Value {
        serde_json::json!({
            "Bucket": self.bucket,
            "Key": self.key,
            "EventId": self.event_id,
            "EventTime": self.event_time.to_rfc3339(),
        })
    }
}
