//! Shared utility functions.
//!
//! - `hash`: stable keyword bucketing (shards, primary account selection)
//! - `jsonl`: append-only newline-delimited JSON files

mod hash;
mod jsonl;

pub use hash::stable_bucket;
pub use jsonl::append_jsonl;

use std::time::Duration;

/// Convert fractional seconds from configuration into a `Duration`, clamping negatives to zero.
pub fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
