//! Checkpoint status models.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted per-keyword status. Only `Success` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordStatus {
    Success,
    Failed,
}

impl KeywordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Row of the status table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub keyword: String,
    pub status: KeywordStatus,
    /// Number of persisted failed attempts.
    pub retries: u32,
    pub error: String,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate counts over the status table.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub by_status: HashMap<KeywordStatus, u64>,
    pub results: u64,
}

impl StoreStats {
    pub fn count(&self, status: KeywordStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.by_status.values().sum()
    }
}
