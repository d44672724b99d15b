//! Data models for the crawl pipeline.

mod account;
mod checkpoint;
mod endpoint;
mod keyword;
mod outcome;

pub use account::{load_accounts, Account, RefreshMethod, RefreshOverrides, DEFAULT_USER_AGENT};
pub use checkpoint::{CheckpointRecord, KeywordStatus, StoreStats};
pub use endpoint::{
    resolve_endpoints, ApiEndpoint, EndpointEntry, EndpointSpec, ItemParser, PageDefaults,
};
pub use keyword::{dedup_keywords, detect_keyword_column, load_keywords, ShardSpec};
pub use outcome::{default_payload, extract_host, Outcome};
