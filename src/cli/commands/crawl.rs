//! The `run` command: crawl keywords until none remain.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::warn;

use kwcrawl::config::{RunArgs, Settings};
use kwcrawl::context::CrawlContext;
use kwcrawl::services::{CrawlEvent, ShutdownSignal, StopReason};

/// Crawl the configured keywords.
pub async fn cmd_run(args: &RunArgs, show_progress: bool) -> anyhow::Result<()> {
    let settings = Settings::resolve(args)?;
    let ctx = CrawlContext::build(settings)?;

    let (shutdown_tx, shutdown) = ShutdownSignal::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight keywords");
            let _ = shutdown_tx.send(true);
        }
    });

    let scheduler = ctx.scheduler(shutdown);
    let done = ctx.done_count().await?;
    ctx.log_startup(done, scheduler.worker_count());

    let todo = ctx.keywords.len() - done;
    if todo == 0 {
        println!(
            "{} All {} keywords are already done",
            style("✓").green(),
            ctx.keywords.len()
        );
        return Ok(());
    }

    println!(
        "{} Crawling {} keywords with {} workers ({} already done)",
        style("→").cyan(),
        todo,
        scheduler.worker_count(),
        done
    );

    let (event_tx, mut event_rx) = mpsc::channel::<CrawlEvent>(100);

    let progress = if show_progress {
        let pb = ProgressBar::new(todo as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        Some(pb)
    } else {
        None
    };

    let progress_clone = progress.clone();
    let event_handler = tokio::spawn(async move {
        let say = |line: String| match &progress_clone {
            Some(pb) => pb.println(line),
            None => println!("{}", line),
        };

        while let Some(event) = event_rx.recv().await {
            match event {
                CrawlEvent::RoundStarted {
                    round, remaining, ..
                } => {
                    if let Some(ref pb) = progress_clone {
                        pb.set_length(remaining as u64);
                        pb.set_position(0);
                        pb.set_message(format!("round {}", round));
                    } else {
                        say(format!(
                            "{} Round {}: {} keywords remaining",
                            style("→").cyan(),
                            round,
                            remaining
                        ));
                    }
                }
                CrawlEvent::KeywordFinished {
                    keyword,
                    found,
                    account,
                    error,
                    ..
                } => {
                    if let Some(ref pb) = progress_clone {
                        pb.inc(1);
                    }
                    let account = account.unwrap_or_else(|| "-".to_string());
                    match error {
                        Some(error) => say(format!(
                            "{} {} [{}]: {}",
                            style("✗").red(),
                            keyword,
                            account,
                            error
                        )),
                        None if progress_clone.is_none() => {
                            let marker = if found {
                                style("✓").green()
                            } else {
                                style("·").dim()
                            };
                            say(format!("{} {} [{}]", marker, keyword, account));
                        }
                        None => {}
                    }
                }
                CrawlEvent::GateEntered {
                    keyword, account, ..
                } => say(format!(
                    "{} Verification gate for {} [{}]",
                    style("!").yellow(),
                    keyword,
                    account.unwrap_or_else(|| "-".to_string())
                )),
                CrawlEvent::GateLeft {
                    keyword,
                    cycles,
                    shared,
                    cleared,
                    ..
                } => {
                    if !cleared {
                        say(format!(
                            "{} Verification gate for {} did not clear",
                            style("!").yellow(),
                            keyword
                        ));
                    } else if !shared {
                        say(format!(
                            "  {} Cleared after {} cycle(s)",
                            style("→").dim(),
                            cycles
                        ));
                    }
                }
                CrawlEvent::WorkerError { keyword, error, .. } => say(format!(
                    "{} {} left pending: {}",
                    style("✗").red(),
                    keyword,
                    error
                )),
                CrawlEvent::RoundFinished {
                    round,
                    progressed,
                    remaining,
                } => {
                    if remaining > 0 {
                        say(format!(
                            "  {} Round {} finished: {} done, {} remaining",
                            style("→").dim(),
                            round,
                            progressed,
                            remaining
                        ));
                    }
                }
            }
        }
    });

    let summary = scheduler.run(&ctx.keywords, Some(event_tx)).await?;

    if let Err(e) = event_handler.await {
        warn!("Event handler task failed: {}", e);
    }
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    println!(
        "{} Processed {} attempts over {} rounds ({} found, {} not found)",
        style("✓").green(),
        summary.processed,
        summary.rounds,
        summary.found,
        summary.not_found
    );
    if summary.gated > 0 {
        println!(
            "  {} {} keywords passed the verification gate",
            style("→").dim(),
            summary.gated
        );
    }
    match summary.stop {
        StopReason::Completed => {}
        StopReason::MaxRounds => println!(
            "  {} Round limit reached with {} keywords remaining",
            style("!").yellow(),
            summary.remaining
        ),
        StopReason::Shutdown => println!(
            "  {} Interrupted with {} keywords remaining",
            style("!").yellow(),
            summary.remaining
        ),
    }
    println!(
        "  {} Results: {}",
        style("→").dim(),
        ctx.settings.output.display()
    );

    Ok(())
}
