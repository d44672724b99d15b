//! Per-account pacing state.

use std::time::Duration;

use tokio::time::Instant;

/// Lowest request rate an account may be configured with.
pub const MIN_QPS: f64 = 0.01;

/// Spacing state for a single account.
#[derive(Debug, Clone)]
pub struct PacerState {
    /// Minimum spacing between two issued requests.
    pub interval: Duration,
    /// Earliest instant the next request may be issued.
    pub next_allowed: Option<Instant>,
    /// Total requests issued.
    pub total_requests: u64,
    /// Total time spent waiting for the next slot.
    pub total_waited: Duration,
}

impl PacerState {
    pub fn new(qps: f64) -> Self {
        let qps = if qps.is_finite() { qps.max(MIN_QPS) } else { MIN_QPS };
        Self {
            interval: Duration::from_secs_f64(1.0 / qps),
            next_allowed: None,
            total_requests: 0,
            total_waited: Duration::ZERO,
        }
    }

    /// Time until the next request may be issued.
    pub fn time_until_ready(&self) -> Duration {
        match self.next_allowed {
            Some(next) => next.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Record a request issued now and schedule the next slot.
    pub fn mark_issued(&mut self) {
        self.next_allowed = Some(Instant::now() + self.interval);
        self.total_requests += 1;
    }
}
