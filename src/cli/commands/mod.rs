//! CLI parser and command dispatch.

mod crawl;
mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use kwcrawl::config::RunArgs;

#[derive(Parser)]
#[command(name = "kwcrawl")]
#[command(about = "Resumable keyword crawler for rate-limited, challenge-protected search APIs")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl every keyword of the CSV that is not yet done
    Run {
        #[command(flatten)]
        args: RunArgs,

        /// Show a progress bar instead of one line per keyword
        #[arg(short = 'P', long)]
        progress: bool,
    },

    /// Summarize the checkpoint database
    Status {
        /// Config file to take state_db, csv and keyword_column from
        #[arg(long)]
        config: Option<PathBuf>,

        /// Checkpoint database
        #[arg(long)]
        state_db: Option<PathBuf>,

        /// Keyword CSV; reports how many of its keywords remain
        #[arg(long)]
        csv: Option<PathBuf>,

        #[arg(long)]
        keyword_column: Option<String>,

        /// Number of recent failures to list
        #[arg(short, long, default_value = "10")]
        failures: usize,
    },
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { args, progress } => crawl::cmd_run(&args, progress).await,
        Commands::Status {
            config,
            state_db,
            csv,
            keyword_column,
            failures,
        } => {
            let target = status::StatusTarget::resolve(config, state_db, csv, keyword_column)?;
            status::cmd_status(&target, failures).await
        }
    }
}
