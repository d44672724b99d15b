//! Repository layer for checkpoint persistence.
//!
//! The checkpoint store is a single embedded SQLite database owned by one
//! process at a time, plus an append-only JSONL mirror of every persisted
//! result.

mod checkpoint;

pub use checkpoint::{CheckpointStore, DEFAULT_BUSY_TIMEOUT};

use chrono::{DateTime, Utc};

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}
