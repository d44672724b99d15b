//! The `status` command: summarize a checkpoint database.

use std::path::PathBuf;

use console::style;

use kwcrawl::config::{FileConfig, DEFAULT_STATE_DB};
use kwcrawl::models::{load_keywords, KeywordStatus};
use kwcrawl::repository::CheckpointStore;

/// What `status` looks at, after merging flags over an optional config file.
pub struct StatusTarget {
    pub state_db: PathBuf,
    pub csv: Option<PathBuf>,
    pub keyword_column: Option<String>,
}

impl StatusTarget {
    pub fn resolve(
        config: Option<PathBuf>,
        state_db: Option<PathBuf>,
        csv: Option<PathBuf>,
        keyword_column: Option<String>,
    ) -> anyhow::Result<Self> {
        let file = match config {
            Some(path) => FileConfig::load(&path)?,
            None => FileConfig::default(),
        };
        Ok(Self {
            state_db: state_db
                .or(file.state_db)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DB)),
            csv: csv.or(file.csv),
            keyword_column: keyword_column.or(file.keyword_column),
        })
    }
}

/// Print counts by status, recent failures and remaining input keywords.
pub async fn cmd_status(target: &StatusTarget, failures: usize) -> anyhow::Result<()> {
    if !target.state_db.exists() {
        println!(
            "{} No checkpoint database at {}",
            style("!").yellow(),
            target.state_db.display()
        );
        return Ok(());
    }

    let store = CheckpointStore::open(&target.state_db, None)?;
    let stats = store.status_counts()?;
    let separator = "─".repeat(60);

    println!();
    println!("{}", style("kwcrawl status").bold());
    println!("{}", separator);
    println!("Database: {}", target.state_db.display());
    println!();

    println!("{}", style("KEYWORDS").cyan().bold());
    println!("  {:<20} {:>10}", "Total:", stats.total());
    for status in [KeywordStatus::Success, KeywordStatus::Failed] {
        println!(
            "  {:<20} {:>10}",
            format!("{}:", status.as_str()),
            stats.count(status)
        );
    }
    println!("  {:<20} {:>10}", "results:", stats.results);

    if let Some(csv) = &target.csv {
        let keywords = load_keywords(csv, target.keyword_column.as_deref(), 0, None)?;
        let done = store.list_done()?;
        let remaining = keywords.iter().filter(|k| !done.contains(*k)).count();
        println!();
        println!("{}", style("INPUT").cyan().bold());
        println!("  {:<20} {:>10}", "Keywords:", keywords.len());
        println!("  {:<20} {:>10}", "Remaining:", remaining);
    }

    let recent = store.recent_failures(failures)?;
    if !recent.is_empty() {
        println!();
        println!("{}", style("RECENT FAILURES").cyan().bold());
        for record in recent {
            println!(
                "  {} {} {} (retries {}) {}",
                style("✗").red(),
                record.updated_at.format("%Y-%m-%d %H:%M:%S"),
                record.keyword,
                record.retries,
                style(record.error).dim()
            );
        }
    }
    println!("{}", separator);

    Ok(())
}
