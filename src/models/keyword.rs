//! Keyword source: CSV loading, deduplication and sharding.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use crate::error::{CrawlError, Result};
use crate::utils::stable_bucket;

/// Header names recognised as the keyword column, in priority order.
const KEYWORD_COLUMN_CANDIDATES: &[&str] =
    &["keyword", "keywords", "关键词", "关键字", "query", "topic", "话题"];

/// Deterministic partition of the keyword set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub index: u64,
    pub total: u64,
}

impl ShardSpec {
    /// Validate `index` in `[0, total)`, `total > 0`.
    pub fn new(index: u64, total: u64) -> Result<Self> {
        if total == 0 {
            return Err(CrawlError::config("shard total must be > 0"));
        }
        if index >= total {
            return Err(CrawlError::config(format!(
                "shard index must be in [0, {})",
                total
            )));
        }
        Ok(Self { index, total })
    }

    pub fn contains(&self, keyword: &str) -> bool {
        stable_bucket(keyword, self.total) == self.index
    }
}

impl std::fmt::Display for ShardSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.index, self.total)
    }
}

/// Pick the keyword column from a header row.
pub fn detect_keyword_column(headers: &[String]) -> Option<String> {
    let by_lower: HashMap<String, &String> = headers
        .iter()
        .map(|h| (h.trim().to_lowercase(), h))
        .collect();
    KEYWORD_COLUMN_CANDIDATES
        .iter()
        .find_map(|c| by_lower.get(*c).map(|h| (*h).clone()))
        .or_else(|| headers.first().cloned())
}

/// Trim, drop empties and drop repeats, keeping first-occurrence order.
pub fn dedup_keywords<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in raw {
        let keyword = item.as_ref().trim();
        if keyword.is_empty() || seen.contains(keyword) {
            continue;
        }
        seen.insert(keyword.to_string());
        out.push(keyword.to_string());
    }
    out
}

fn read_column(content: &str, column: Option<&str>) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();
    if headers.is_empty() {
        return Ok(Vec::new());
    }

    let wanted = match column.map(str::trim).filter(|c| !c.is_empty()) {
        Some(c) => c.to_string(),
        None => detect_keyword_column(&headers).unwrap_or_default(),
    };
    let idx = headers.iter().position(|h| *h == wanted).ok_or_else(|| {
        CrawlError::config(format!(
            "CSV column '{}' not found, available: {:?}",
            wanted, headers
        ))
    })?;

    let mut values = Vec::new();
    for record in reader.records() {
        let record = record?;
        values.push(record.get(idx).unwrap_or_default().to_string());
    }
    Ok(values)
}

/// Load the ordered, unique keyword list from a CSV file.
///
/// Order of filters: dedup, shard, then `limit` (0 = no limit).
pub fn load_keywords(
    path: &Path,
    column: Option<&str>,
    limit: usize,
    shard: Option<ShardSpec>,
) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).map_err(|e| {
        CrawlError::config(format!("cannot read keyword CSV {}: {}", path.display(), e))
    })?;
    let content = content.strip_prefix('\u{feff}').unwrap_or(&content);

    let mut keywords = dedup_keywords(read_column(content, column)?);
    if let Some(shard) = shard {
        keywords.retain(|k| shard.contains(k));
    }
    if limit > 0 {
        keywords.truncate(limit);
    }
    Ok(keywords)
}
