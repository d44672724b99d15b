//! Crawl scheduler.
//!
//! Runs rounds over the keywords that are not yet done. Each round feeds a
//! shared queue to a pool of worker tasks; a worker processes a keyword,
//! passes the verification gate when configured, and persists the outcome.
//! Rounds repeat until nothing remains, the round ceiling is hit, or shutdown
//! is requested.

mod types;

pub use types::{CrawlEvent, CrawlSummary, SchedulerConfig, StopReason};

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use super::keyword::KeywordProcessor;
use super::shutdown::ShutdownSignal;
use super::verify_gate::GateRegistry;
use crate::error::Result;
use crate::models::Outcome;
use crate::repository::CheckpointStore;

#[derive(Default)]
struct Counters {
    processed: AtomicUsize,
    found: AtomicUsize,
    not_found: AtomicUsize,
    gated: AtomicUsize,
}

/// Worker-pool scheduler over a checkpoint store.
pub struct CrawlScheduler {
    processor: Arc<KeywordProcessor>,
    store: Arc<Mutex<CheckpointStore>>,
    gates: Arc<GateRegistry>,
    config: SchedulerConfig,
    shutdown: ShutdownSignal,
}

impl CrawlScheduler {
    pub fn new(
        processor: Arc<KeywordProcessor>,
        store: Arc<Mutex<CheckpointStore>>,
        gates: Arc<GateRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            processor,
            store,
            gates,
            config,
            shutdown: ShutdownSignal::never(),
        }
    }

    /// Stop cooperatively when `shutdown` triggers.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Workers per round: the requested concurrency, at most one per account.
    pub fn worker_count(&self) -> usize {
        self.config
            .concurrency
            .min(self.processor.clients().len())
            .max(1)
    }

    fn remaining<'a>(keywords: &'a [String], done: &HashSet<String>) -> Vec<&'a String> {
        keywords.iter().filter(|k| !done.contains(*k)).collect()
    }

    /// Crawl `keywords` until every one of them is done.
    pub async fn run(
        &self,
        keywords: &[String],
        events: Option<mpsc::Sender<CrawlEvent>>,
    ) -> Result<CrawlSummary> {
        let counters = Arc::new(Counters::default());
        let mut shutdown = self.shutdown.clone();
        let mut round = 0u32;

        let stop = loop {
            if shutdown.is_triggered() {
                break StopReason::Shutdown;
            }

            let done = self.store.lock().await.list_done()?;
            let todo: Vec<String> = Self::remaining(keywords, &done)
                .into_iter()
                .cloned()
                .collect();
            if todo.is_empty() {
                break StopReason::Completed;
            }
            if self.config.max_rounds > 0 && round >= self.config.max_rounds {
                warn!(
                    "Reached {} rounds with {} keywords remaining",
                    self.config.max_rounds,
                    todo.len()
                );
                break StopReason::MaxRounds;
            }

            round += 1;
            let before = todo.len();
            info!(
                "round={} start done={} remaining={}",
                round,
                keywords.len() - before,
                before
            );
            send(
                &events,
                CrawlEvent::RoundStarted {
                    round,
                    done: keywords.len() - before,
                    remaining: before,
                },
            )
            .await;

            self.run_round(todo, &events, &counters).await;

            let done = self.store.lock().await.list_done()?;
            let remaining = Self::remaining(keywords, &done).len();
            let progressed = before.saturating_sub(remaining);
            info!(
                "round={} end progress={} remaining={}",
                round, progressed, remaining
            );
            send(
                &events,
                CrawlEvent::RoundFinished {
                    round,
                    progressed,
                    remaining,
                },
            )
            .await;

            if remaining > 0 && progressed == 0 && shutdown.sleep(self.config.idle_pause).await {
                break StopReason::Shutdown;
            }
        };

        let done = self.store.lock().await.list_done()?;
        Ok(CrawlSummary {
            rounds: round,
            processed: counters.processed.load(Ordering::Relaxed),
            found: counters.found.load(Ordering::Relaxed),
            not_found: counters.not_found.load(Ordering::Relaxed),
            gated: counters.gated.load(Ordering::Relaxed),
            remaining: Self::remaining(keywords, &done).len(),
            stop,
        })
    }

    async fn run_round(
        &self,
        todo: Vec<String>,
        events: &Option<mpsc::Sender<CrawlEvent>>,
        counters: &Arc<Counters>,
    ) {
        let queue = Arc::new(Mutex::new(VecDeque::from(todo)));
        let workers = self.worker_count();
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let worker = Worker {
                id: worker_id,
                processor: self.processor.clone(),
                store: self.store.clone(),
                gates: self.gates.clone(),
                config: self.config.clone(),
                shutdown: self.shutdown.clone(),
                events: events.clone(),
                counters: counters.clone(),
            };
            let queue = queue.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    if worker.shutdown.is_triggered() {
                        break;
                    }
                    let Some(keyword) = queue.lock().await.pop_front() else {
                        break;
                    };
                    if let Err(e) = worker.run_one(&keyword).await {
                        error!("worker={} keyword={} error={}", worker.id, keyword, e.describe());
                        send(
                            &worker.events,
                            CrawlEvent::WorkerError {
                                worker_id: worker.id,
                                keyword: keyword.clone(),
                                error: e.describe(),
                            },
                        )
                        .await;
                    }
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Crawl worker panicked: {}", e);
            }
        }
    }
}

async fn send(events: &Option<mpsc::Sender<CrawlEvent>>, event: CrawlEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}

struct Worker {
    id: usize,
    processor: Arc<KeywordProcessor>,
    store: Arc<Mutex<CheckpointStore>>,
    gates: Arc<GateRegistry>,
    config: SchedulerConfig,
    shutdown: ShutdownSignal,
    events: Option<mpsc::Sender<CrawlEvent>>,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run_one(&self, keyword: &str) -> Result<()> {
        let mut outcome = self.processor.process(keyword).await;

        if self.config.refresh_on_not_found && !outcome.found {
            outcome = self.pass_gate(keyword, outcome).await;
        }

        self.store.lock().await.upsert(&outcome)?;

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        if outcome.found {
            self.counters.found.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.not_found.fetch_add(1, Ordering::Relaxed);
        }
        send(
            &self.events,
            CrawlEvent::KeywordFinished {
                worker_id: self.id,
                keyword: keyword.to_string(),
                found: outcome.found,
                account: outcome.account.clone(),
                error: outcome.error.clone(),
            },
        )
        .await;
        Ok(())
    }

    /// Wait out the gate of the account that produced `outcome`, then retry once if configured.
    ///
    /// The retry's outcome replaces the first one whether or not it succeeded.
    async fn pass_gate(&self, keyword: &str, outcome: Outcome) -> Outcome {
        let account_name = outcome.account.clone();
        let account = account_name
            .as_deref()
            .and_then(|name| self.processor.account_named(name));
        let gate = self.gates.gate_for(account).await;
        self.counters.gated.fetch_add(1, Ordering::Relaxed);

        send(
            &self.events,
            CrawlEvent::GateEntered {
                worker_id: self.id,
                keyword: keyword.to_string(),
                account: account_name.clone(),
            },
        )
        .await;

        let label = account_name.as_deref().unwrap_or("-");
        let report = gate.run(keyword, label, &self.shutdown).await;

        send(
            &self.events,
            CrawlEvent::GateLeft {
                worker_id: self.id,
                keyword: keyword.to_string(),
                cycles: report.cycles,
                shared: report.shared,
                cleared: report.cleared(),
            },
        )
        .await;

        if report.cleared() && self.config.retry_after_verify {
            info!("account={} keyword={} retry once after verify gate", label, keyword);
            return self.processor.process(keyword).await;
        }
        outcome
    }
}
