//! Crawl scheduler types and events.

use std::time::Duration;

/// Events emitted while a crawl runs.
#[derive(Debug, Clone)]
pub enum CrawlEvent {
    RoundStarted {
        round: u32,
        done: usize,
        remaining: usize,
    },
    /// An outcome was persisted.
    KeywordFinished {
        worker_id: usize,
        keyword: String,
        found: bool,
        account: Option<String>,
        error: Option<String>,
    },
    /// A worker is waiting on the verification gate.
    GateEntered {
        worker_id: usize,
        keyword: String,
        account: Option<String>,
    },
    GateLeft {
        worker_id: usize,
        keyword: String,
        cycles: u32,
        shared: bool,
        cleared: bool,
    },
    /// Dispatching a keyword failed; it stays pending for the next round.
    WorkerError {
        worker_id: usize,
        keyword: String,
        error: String,
    },
    RoundFinished {
        round: u32,
        progressed: usize,
        remaining: usize,
    },
}

/// Why the scheduler stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every keyword is done.
    Completed,
    /// The configured round ceiling was reached with work left.
    MaxRounds,
    Shutdown,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::MaxRounds => "max_rounds",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Result of a crawl.
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub rounds: u32,
    /// Outcomes persisted.
    pub processed: usize,
    pub found: usize,
    pub not_found: usize,
    /// Keywords that went through the verification gate.
    pub gated: usize,
    pub remaining: usize,
    pub stop: StopReason,
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Requested workers; capped at the account count.
    pub concurrency: usize,
    /// Run the verification gate when a keyword comes back not-found.
    pub refresh_on_not_found: bool,
    /// Process the keyword once more after the gate clears.
    pub retry_after_verify: bool,
    /// Round ceiling; 0 is unbounded.
    pub max_rounds: u32,
    /// Pause before another round when a round made no progress.
    pub idle_pause: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            refresh_on_not_found: false,
            retry_after_verify: true,
            max_rounds: 0,
            idle_pause: Duration::from_secs(1),
        }
    }
}
