//! Per-account request pacing.
//!
//! Every account owns one [`RequestPacer`]. A pacer serializes the requests
//! issued through it and spaces them at least `1 / qps` apart, no matter how
//! many tasks share the account.

mod pacer_state;

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

pub use pacer_state::{PacerState, MIN_QPS};

/// Serialized, spaced request channel for one account.
#[derive(Debug)]
pub struct RequestPacer {
    label: String,
    state: Mutex<PacerState>,
}

/// Snapshot of a pacer's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacerStats {
    pub total_requests: u64,
    pub total_waited: Duration,
}

impl RequestPacer {
    pub fn new(label: impl Into<String>, qps: f64) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(PacerState::new(qps)),
        }
    }

    /// Minimum spacing between two requests.
    pub async fn interval(&self) -> Duration {
        self.state.lock().await.interval
    }

    /// Run `issue` in this account's next slot.
    ///
    /// The lock is held from the readiness check until `issue` completes, so
    /// the wait, the request and the rescheduling form one step per account.
    pub async fn pace<F, Fut, T>(&self, issue: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut state = self.state.lock().await;

        let wait = state.time_until_ready();
        if wait > Duration::ZERO {
            debug!("Pacing {}: waiting {:?}", self.label, wait);
            tokio::time::sleep(wait).await;
            state.total_waited += wait;
        }

        state.mark_issued();
        issue().await
    }

    pub async fn stats(&self) -> PacerStats {
        let state = self.state.lock().await;
        PacerStats {
            total_requests: state.total_requests,
            total_waited: state.total_waited,
        }
    }
}
