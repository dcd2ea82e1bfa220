//! Utility functions for timestamps, run identifiers and content fingerprints.

pub mod timestamps;
mod ids;

pub use ids::{content_fingerprint, generate_run_id};
pub use timestamps::{
    format_timestamp, parse_timestamp, parse_unix_timestamp, timestamp_from_value, to_date_string,
    truncate_to_hour, Timestamp, TimestampError, UnixPrecision,
};
