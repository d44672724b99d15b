//! Run configuration: CLI flags, the optional JSON config file and the
//! validated [`Settings`] built from both.
//!
//! Precedence is explicit CLI flag, then config file, then built-in default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{CrawlError, Result};
use crate::models::{resolve_endpoints, ApiEndpoint, EndpointSpec, PageDefaults, RefreshMethod, ShardSpec};
use crate::scrapers::endpoint::DEFAULT_API_BASE;
use crate::scrapers::normalize_templates;
use crate::services::{GateSettings, ProcessorConfig, SchedulerConfig};
use crate::utils::secs;

pub const DEFAULT_OUTPUT: &str = "output/kwcrawl_results.jsonl";
pub const DEFAULT_STATE_DB: &str = "output/kwcrawl_state.db";
pub const DEFAULT_ACCOUNT_QPS: f64 = 2.0;
pub const DEFAULT_TIMEOUT_SECS: f64 = 20.0;

/// Flags of the `run` command. Every flag may also come from `--config`.
#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// JSON file whose keys are any of these flags in snake_case
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Keyword CSV
    #[arg(long)]
    pub csv: Option<PathBuf>,

    /// Accounts JSON array
    #[arg(long)]
    pub accounts: Option<PathBuf>,

    /// Result log (JSONL, one line per persisted attempt)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Audit log of raw API responses (JSONL); disabled when empty
    #[arg(long)]
    pub raw_log: Option<PathBuf>,

    /// Checkpoint database
    #[arg(long)]
    pub state_db: Option<PathBuf>,

    /// Keyword column name (auto-detected when unset)
    #[arg(long)]
    pub keyword_column: Option<String>,

    /// Shard index; -1 disables sharding
    #[arg(long, allow_negative_numbers = true)]
    pub shard_index: Option<i64>,

    /// Number of shards
    #[arg(long)]
    pub shard_total: Option<i64>,

    /// Requests per second for accounts without their own qps
    #[arg(long)]
    pub per_account_qps: Option<f64>,

    /// HTTP timeout in seconds
    #[arg(long)]
    pub timeout: Option<f64>,

    /// Attempts per keyword over the account order
    #[arg(long)]
    pub max_retries: Option<u32>,

    #[arg(long)]
    pub max_media_pages: Option<u32>,

    #[arg(long)]
    pub max_contrib_pages: Option<u32>,

    /// Accept an empty contributors list as a real answer
    #[arg(long)]
    pub allow_empty_contrib: bool,

    /// Comma list of built-in endpoint names, or a JSON array of names/objects
    #[arg(long)]
    pub api_endpoints: Option<String>,

    /// Comma list or JSON array of query templates using {keyword}
    #[arg(long)]
    pub query_templates: Option<String>,

    /// Container API base URL
    #[arg(long)]
    pub api_base: Option<String>,

    /// Process at most this many keywords (0 = all)
    #[arg(long)]
    pub limit: Option<usize>,

    /// Run the verification gate when a keyword comes back not-found
    #[arg(long)]
    pub refresh_on_not_found: bool,

    /// Retry a not-found keyword once after the gate clears
    #[arg(long, overrides_with = "no_retry_false_after_verify")]
    pub retry_false_after_verify: bool,

    #[arg(long, overrides_with = "retry_false_after_verify")]
    pub no_retry_false_after_verify: bool,

    /// auto, mac or windows
    #[arg(long, value_enum)]
    pub refresh_method: Option<RefreshMethod>,

    /// Seconds to wait after a refresh clears
    #[arg(long)]
    pub refresh_wait: Option<f64>,

    #[arg(long)]
    pub verify_poll_interval: Option<f64>,

    #[arg(long)]
    pub verify_cycle_timeout: Option<f64>,

    #[arg(long)]
    pub refresh_url_keyword: Option<String>,

    #[arg(long)]
    pub refresh_window_keyword: Option<String>,

    /// 1-based browser window index (0 = any)
    #[arg(long)]
    pub refresh_window_index: Option<u32>,

    /// window.name tag of the challenge tab
    #[arg(long)]
    pub refresh_window_tag: Option<String>,

    /// Worker count, capped at the number of accounts
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Only ever use a keyword's primary account
    #[arg(long)]
    pub strict_account_isolation: bool,

    #[arg(long, overrides_with = "no_fallback_to_other_accounts")]
    pub fallback_to_other_accounts: bool,

    #[arg(long, overrides_with = "fallback_to_other_accounts")]
    pub no_fallback_to_other_accounts: bool,

    /// Stop after this many rounds (0 = until no work remains)
    #[arg(long)]
    pub max_rounds: Option<u32>,
}

/// Contents of a `--config` file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub csv: Option<PathBuf>,
    pub accounts: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub raw_log: Option<PathBuf>,
    pub state_db: Option<PathBuf>,
    pub keyword_column: Option<String>,
    pub shard_index: Option<i64>,
    pub shard_total: Option<i64>,
    pub per_account_qps: Option<f64>,
    pub timeout: Option<f64>,
    pub max_retries: Option<u32>,
    pub max_media_pages: Option<u32>,
    pub max_contrib_pages: Option<u32>,
    pub allow_empty_contrib: Option<bool>,
    pub api_endpoints: Option<Value>,
    pub query_templates: Option<Value>,
    pub api_base: Option<String>,
    pub limit: Option<usize>,
    pub refresh_on_not_found: Option<bool>,
    pub retry_false_after_verify: Option<bool>,
    pub refresh_method: Option<RefreshMethod>,
    pub refresh_wait: Option<f64>,
    pub verify_poll_interval: Option<f64>,
    pub verify_cycle_timeout: Option<f64>,
    pub refresh_url_keyword: Option<String>,
    pub refresh_window_keyword: Option<String>,
    pub refresh_window_index: Option<u32>,
    pub refresh_window_tag: Option<String>,
    pub concurrency: Option<usize>,
    pub strict_account_isolation: Option<bool>,
    pub fallback_to_other_accounts: Option<bool>,
    pub max_rounds: Option<u32>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            CrawlError::config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            CrawlError::config(format!("invalid config file {}: {}", path.display(), e))
        })
    }
}

/// Parse a list-valued setting given either as a comma list or as JSON.
///
/// A JSON value that is not an array becomes a one-element list.
pub fn parse_list(raw: &str, field: &str) -> Result<Vec<Value>> {
    let text = raw.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    if text.starts_with('[') || text.starts_with('{') {
        let parsed: Value = serde_json::from_str(text)
            .map_err(|e| CrawlError::config(format!("{} is not valid JSON: {}", field, e)))?;
        return Ok(match parsed {
            Value::Array(items) => items,
            other => vec![other],
        });
    }
    Ok(text
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Value::String(s.to_string()))
        .collect())
}

fn list_value(value: Option<Value>, field: &str) -> Result<Vec<Value>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(Value::String(s)) => parse_list(&s, field),
        Some(other) => Err(CrawlError::config(format!(
            "{} must be a list or a string, got {}",
            field, other
        ))),
    }
}

fn endpoint_specs(values: Vec<Value>) -> Result<Vec<EndpointSpec>> {
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            serde_json::from_value(v).map_err(|e| {
                CrawlError::config(format!("api_endpoints[{}] is invalid: {}", i, e))
            })
        })
        .collect()
}

fn template_strings(values: Vec<Value>) -> Result<Vec<String>> {
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| match v {
            Value::String(s) => Ok(s),
            _ => Err(CrawlError::config(format!(
                "query_templates[{}] must be a string",
                i
            ))),
        })
        .collect()
}

fn positive_secs(value: f64, field: &str) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(CrawlError::config(format!("{} must be > 0", field)));
    }
    Ok(secs(value))
}

fn shard_from(index: i64, total: i64) -> Result<Option<ShardSpec>> {
    if total <= 0 {
        return Err(CrawlError::config("shard total must be > 0"));
    }
    if index < 0 {
        return Ok(None);
    }
    ShardSpec::new(index as u64, total as u64).map(Some)
}

/// Fully resolved, validated configuration for one run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub csv: PathBuf,
    pub accounts: PathBuf,
    pub output: PathBuf,
    pub raw_log: Option<PathBuf>,
    pub state_db: PathBuf,
    pub keyword_column: Option<String>,
    pub limit: usize,
    pub shard: Option<ShardSpec>,
    pub default_qps: f64,
    pub timeout: Duration,
    pub api_base: String,
    pub endpoints: Vec<ApiEndpoint>,
    pub query_templates: Vec<String>,
    pub processor: ProcessorConfig,
    pub scheduler: SchedulerConfig,
    pub gate: GateSettings,
}

impl Settings {
    /// Merge CLI flags over the config file (if any) and validate the result.
    pub fn resolve(args: &RunArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, file)
    }

    pub fn merge(args: &RunArgs, file: FileConfig) -> Result<Self> {
        let (Some(csv), Some(accounts)) = (
            args.csv.clone().or(file.csv),
            args.accounts.clone().or(file.accounts),
        ) else {
            return Err(CrawlError::config(
                "--csv and --accounts are required (directly or through --config)",
            ));
        };

        let shard = shard_from(
            args.shard_index.or(file.shard_index).unwrap_or(-1),
            args.shard_total.or(file.shard_total).unwrap_or(1),
        )?;

        let default_qps = args
            .per_account_qps
            .or(file.per_account_qps)
            .unwrap_or(DEFAULT_ACCOUNT_QPS);
        if !default_qps.is_finite() || default_qps <= 0.0 {
            return Err(CrawlError::config("per_account_qps must be > 0"));
        }
        let timeout = positive_secs(
            args.timeout.or(file.timeout).unwrap_or(DEFAULT_TIMEOUT_SECS),
            "timeout",
        )?;

        let pages = PageDefaults {
            media: args.max_media_pages.or(file.max_media_pages).unwrap_or(12),
            contributors: args.max_contrib_pages.or(file.max_contrib_pages).unwrap_or(3),
        };
        let endpoint_values = list_value(
            args.api_endpoints.clone().map(Value::String).or(file.api_endpoints),
            "api_endpoints",
        )?;
        let endpoints = resolve_endpoints(&endpoint_specs(endpoint_values)?, &pages)?;

        let template_values = list_value(
            args.query_templates.clone().map(Value::String).or(file.query_templates),
            "query_templates",
        )?;
        let query_templates = normalize_templates(&template_strings(template_values)?)?;

        let api_base = args
            .api_base
            .clone()
            .or(file.api_base)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let defaults = ProcessorConfig::default();
        let processor = ProcessorConfig {
            max_retries: args
                .max_retries
                .or(file.max_retries)
                .unwrap_or(defaults.max_retries)
                .max(1),
            strict_account_isolation: args.strict_account_isolation
                || file.strict_account_isolation.unwrap_or(false),
            fallback_to_other_accounts: switch(
                args.fallback_to_other_accounts,
                args.no_fallback_to_other_accounts,
                file.fallback_to_other_accounts,
                defaults.fallback_to_other_accounts,
            ),
            allow_empty_contributors: args.allow_empty_contrib
                || file.allow_empty_contrib.unwrap_or(false),
            ..defaults
        };

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            concurrency: args
                .concurrency
                .or(file.concurrency)
                .unwrap_or(defaults.concurrency)
                .max(1),
            refresh_on_not_found: args.refresh_on_not_found
                || file.refresh_on_not_found.unwrap_or(false),
            retry_after_verify: switch(
                args.retry_false_after_verify,
                args.no_retry_false_after_verify,
                file.retry_false_after_verify,
                defaults.retry_after_verify,
            ),
            max_rounds: args.max_rounds.or(file.max_rounds).unwrap_or(0),
            ..defaults
        };

        let defaults = GateSettings::default();
        let gate = GateSettings {
            method: args.refresh_method.or(file.refresh_method).unwrap_or(defaults.method),
            url_keyword: args
                .refresh_url_keyword
                .clone()
                .or(file.refresh_url_keyword)
                .unwrap_or(defaults.url_keyword),
            window_keyword: args
                .refresh_window_keyword
                .clone()
                .or(file.refresh_window_keyword)
                .unwrap_or(defaults.window_keyword),
            window_index: args
                .refresh_window_index
                .or(file.refresh_window_index)
                .unwrap_or(defaults.window_index),
            window_tag: args
                .refresh_window_tag
                .clone()
                .or(file.refresh_window_tag)
                .map(|s| s.trim().to_string())
                .unwrap_or(defaults.window_tag),
            refresh_wait: match args.refresh_wait.or(file.refresh_wait) {
                Some(v) => secs(v),
                None => defaults.refresh_wait,
            },
            poll_interval: match args.verify_poll_interval.or(file.verify_poll_interval) {
                Some(v) => secs(v),
                None => defaults.poll_interval,
            },
            cycle_timeout: match args.verify_cycle_timeout.or(file.verify_cycle_timeout) {
                Some(v) => secs(v),
                None => defaults.cycle_timeout,
            },
        }
        .clamped();

        Ok(Self {
            csv,
            accounts,
            output: args
                .output
                .clone()
                .or(file.output)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT)),
            raw_log: args
                .raw_log
                .clone()
                .or(file.raw_log)
                .filter(|p| !p.as_os_str().is_empty()),
            state_db: args
                .state_db
                .clone()
                .or(file.state_db)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DB)),
            keyword_column: args
                .keyword_column
                .clone()
                .or(file.keyword_column)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            limit: args.limit.or(file.limit).unwrap_or(0),
            shard,
            default_qps,
            timeout,
            api_base,
            endpoints,
            query_templates,
            processor,
            scheduler,
            gate,
        })
    }
}

/// Resolve a `--flag`/`--no-flag` pair. The CLI wins over the file.
fn switch(on: bool, off: bool, file: Option<bool>, default: bool) -> bool {
    if off {
        false
    } else if on {
        true
    } else {
        file.unwrap_or(default)
    }
}
