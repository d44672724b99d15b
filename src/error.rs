//! Error taxonomy shared by every crawl component.

use std::path::PathBuf;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, CrawlError>;

#[derive(Debug, Error)]
pub enum CrawlError {
    /// Network failure, timeout, non-2xx status or an unparseable body.
    #[error("{0}")]
    Transport(String),

    /// The platform rejected the request with its risk-control sentinel.
    #[error("risk control blocked url={url}")]
    RiskControlBlocked { url: String },

    /// The payload carried a negative status or error number.
    #[error("api error ok={ok} errno={errno} url={url}")]
    Api {
        ok: String,
        errno: String,
        url: String,
    },

    /// An endpoint that must return items came back empty.
    #[error("{0} empty")]
    EmptyResult(String),

    #[error("{0}")]
    Config(String),

    #[error("checkpoint store is busy: {}. Stop the other running crawler and retry.", path.display())]
    StoreBusy { path: PathBuf },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CrawlError {
    pub fn config(msg: impl Into<String>) -> Self {
        CrawlError::Config(msg.into())
    }

    /// Short variant name, used as the prefix of persisted error strings.
    pub fn kind(&self) -> &'static str {
        match self {
            CrawlError::Transport(_) => "TransportError",
            CrawlError::RiskControlBlocked { .. } => "RiskControlBlocked",
            CrawlError::Api { .. } => "ApiError",
            CrawlError::EmptyResult(_) => "EmptyResult",
            CrawlError::Config(_) => "ConfigError",
            CrawlError::StoreBusy { .. } => "StoreBusyError",
            CrawlError::Database(_) => "DatabaseError",
            CrawlError::Io(_) => "IoError",
            CrawlError::Json(_) => "JsonError",
        }
    }

    /// Whether a per-keyword attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CrawlError::Config(_) | CrawlError::StoreBusy { .. })
    }

    /// `Kind: message`, the form stored in the checkpoint error column.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

impl From<reqwest::Error> for CrawlError {
    fn from(e: reqwest::Error) -> Self {
        CrawlError::Transport(e.to_string())
    }
}

impl From<csv::Error> for CrawlError {
    fn from(e: csv::Error) -> Self {
        CrawlError::Config(format!("failed to read CSV: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_prefixes_kind() {
        let err = CrawlError::RiskControlBlocked {
            url: "https://example.com/api".to_string(),
        };
        assert_eq!(
            err.describe(),
            "RiskControlBlocked: risk control blocked url=https://example.com/api"
        );
    }

    #[test]
    fn test_setup_errors_are_not_retryable() {
        assert!(!CrawlError::config("bad shard").is_retryable());
        assert!(!CrawlError::StoreBusy {
            path: PathBuf::from("state.db")
        }
        .is_retryable());
        assert!(CrawlError::Transport("timeout".into()).is_retryable());
        assert!(CrawlError::EmptyResult("contributors".into()).is_retryable());
    }
}
