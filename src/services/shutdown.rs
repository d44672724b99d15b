//! Cooperative shutdown flag shared by workers and the verification gate.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Receiving side of the shutdown flag. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A sender that requests shutdown with `send(true)`, and its signal.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal that is never triggered.
    pub fn never() -> Self {
        let (_, signal) = Self::channel();
        signal
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration` unless shutdown is requested first.
    ///
    /// Returns `true` when shutdown was requested.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        // Sender gone: the flag can no longer change.
                        tokio::time::sleep_until(deadline).await;
                        return self.is_triggered();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_never_sleeps_full_duration() {
        let mut signal = ShutdownSignal::never();
        let start = Instant::now();
        assert!(!signal.sleep(Duration::from_secs(3)).await);
        assert_eq!(Instant::now() - start, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_interrupts_sleep() {
        let (tx, mut signal) = ShutdownSignal::channel();
        let start = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = tx.send(true);
        });
        assert!(signal.sleep(Duration::from_secs(60)).await);
        assert!(Instant::now() - start < Duration::from_secs(60));
        assert!(signal.is_triggered());
    }
}
