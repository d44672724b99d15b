//! kwcrawl - resumable bulk keyword crawler.
//!
//! Turns a keyword list and a pool of credentialed accounts into a
//! checkpointed stream of per-keyword results, pacing each account,
//! falling back across accounts and query variants, and pausing the
//! whole pipeline behind a verification gate when the remote service
//! interposes a human-verification challenge.

pub mod config;
pub mod context;
pub mod error;
pub mod models;
pub mod repository;
pub mod scrapers;
pub mod services;
pub mod utils;

pub use error::{CrawlError, Result};
