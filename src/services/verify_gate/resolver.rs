//! The challenge-resolver seam.

use async_trait::async_trait;
use thiserror::Error;

use super::SurfaceSelector;

/// What the challenge surface currently shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeState {
    /// No challenge on the surface.
    Cleared,
    /// Challenge still shown.
    Pending,
    /// The in-page check itself failed; treated as still pending.
    CheckError(String),
}

impl ChallengeState {
    /// Parse check output: `OK`, `PENDING`, `JSERR:<detail>`. Anything else is pending.
    pub fn parse(output: &str) -> Self {
        let trimmed = output.trim();
        let upper = trimmed.to_ascii_uppercase();
        if upper == "OK" {
            Self::Cleared
        } else if upper.starts_with("JSERR") {
            Self::CheckError(trimmed.to_string())
        } else {
            Self::Pending
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolverError {
    /// The surface refuses script execution, so the in-page check cannot run.
    #[error("scripting disabled on challenge surface: {0}")]
    ScriptingDisabled(String),

    #[error("{0}")]
    Failed(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Drives the external surface where a human-verification challenge is shown.
#[async_trait]
pub trait ChallengeResolver: Send + Sync {
    /// Whether [`poll_state`](Self::poll_state) works for this surface.
    fn supports_inspection(&self, selector: &SurfaceSelector) -> bool;

    /// Reload the challenge surface.
    async fn refresh(&self, selector: &SurfaceSelector) -> Result<(), ResolverError>;

    /// Inspect the surface for the challenge.
    async fn poll_state(&self, selector: &SurfaceSelector) -> Result<ChallengeState, ResolverError>;

    /// Current location (URL) of the surface.
    async fn current_location(&self, selector: &SurfaceSelector) -> Result<String, ResolverError>;
}
