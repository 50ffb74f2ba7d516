//! Utility functions for id generation, timestamps and graph validation.

pub mod timestamps;
pub mod validation;
mod ids;

pub use ids::{execution_id, fingerprint, generate_uuid};
pub use timestamps::{iso_timestamp, now_utc, parse_event_time, Timestamp};
