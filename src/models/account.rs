//! Account identities and the accounts file loader.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::{CrawlError, Result};

/// Mobile Safari user agent used when an account does not configure one.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";

pub const DEFAULT_REFERER: &str = "https://m.weibo.cn/";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "zh-CN,zh;q=0.9,en;q=0.8";

/// How the verification gate drives the browser surface holding the challenge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMethod {
    /// Pick by host operating system.
    #[default]
    Auto,
    /// AppleScript against Google Chrome.
    Mac,
    /// PowerShell window activation plus Ctrl+R.
    Windows,
}

impl RefreshMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Mac => "mac",
            Self::Windows => "windows",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "mac" => Some(Self::Mac),
            "windows" => Some(Self::Windows),
            _ => None,
        }
    }
}

/// Per-account overrides of the global verification gate surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOverrides {
    pub method: Option<RefreshMethod>,
    pub url_keyword: Option<String>,
    pub window_keyword: Option<String>,
    /// 1-based browser window index.
    pub window_index: Option<u32>,
    pub window_tag: Option<String>,
}

/// One credentialed identity. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Account {
    pub name: String,
    /// Raw `name=value; name2=value2` cookie string.
    pub cookie: String,
    pub user_agent: String,
    pub referer: String,
    pub accept_language: String,
    /// Requests per second.
    pub qps: f64,
    pub refresh: RefreshOverrides,
}

impl Account {
    /// Account with default headers and no gate overrides.
    pub fn new(name: impl Into<String>, cookie: impl Into<String>, qps: f64) -> Self {
        Self {
            name: name.into(),
            cookie: cookie.into(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            referer: DEFAULT_REFERER.to_string(),
            accept_language: DEFAULT_ACCEPT_LANGUAGE.to_string(),
            qps,
            refresh: RefreshOverrides::default(),
        }
    }
}

/// Raw entry in the accounts file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AccountEntry {
    name: Option<String>,
    cookie: Option<String>,
    user_agent: Option<String>,
    referer: Option<String>,
    accept_language: Option<String>,
    qps: Option<f64>,
    refresh_method: Option<String>,
    refresh_url_keyword: Option<String>,
    refresh_window_keyword: Option<String>,
    refresh_window_index: Option<u32>,
    refresh_window_tag: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl AccountEntry {
    fn into_account(self, position: usize, default_qps: f64) -> Result<Option<Account>> {
        let Some(cookie) = non_empty(self.cookie) else {
            return Ok(None);
        };
        let name = non_empty(self.name).unwrap_or_else(|| format!("acc{}", position));

        let method = match non_empty(self.refresh_method) {
            Some(raw) => Some(RefreshMethod::from_str(&raw).ok_or_else(|| {
                CrawlError::config(format!(
                    "account {}: unknown refresh_method '{}' (expected auto, mac or windows)",
                    name, raw
                ))
            })?),
            None => None,
        };

        let qps = self.qps.filter(|q| *q > 0.0).unwrap_or(default_qps);

        Ok(Some(Account {
            name,
            cookie,
            user_agent: non_empty(self.user_agent).unwrap_or_else(|| DEFAULT_USER_AGENT.into()),
            referer: non_empty(self.referer).unwrap_or_else(|| DEFAULT_REFERER.into()),
            accept_language: non_empty(self.accept_language)
                .unwrap_or_else(|| DEFAULT_ACCEPT_LANGUAGE.into()),
            qps,
            refresh: RefreshOverrides {
                method,
                url_keyword: non_empty(self.refresh_url_keyword),
                window_keyword: non_empty(self.refresh_window_keyword),
                window_index: self.refresh_window_index.filter(|i| *i > 0),
                window_tag: non_empty(self.refresh_window_tag),
            },
        }))
    }
}

/// Load the accounts file: a non-empty JSON array of account objects.
///
/// Entries without a cookie are skipped; a file with no usable entry is an error.
pub fn load_accounts(path: &Path, default_qps: f64) -> Result<Vec<Account>> {
    let raw = fs::read_to_string(path).map_err(|e| {
        CrawlError::config(format!("cannot read accounts file {}: {}", path.display(), e))
    })?;
    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
        CrawlError::config(format!("accounts file {} is not valid JSON: {}", path.display(), e))
    })?;

    let entries = match value {
        serde_json::Value::Array(items) if !items.is_empty() => items,
        _ => {
            return Err(CrawlError::config(
                "accounts file must be a non-empty JSON array",
            ))
        }
    };

    let mut accounts = Vec::new();
    let mut names = HashSet::new();
    for (i, entry) in entries.into_iter().enumerate() {
        let position = i + 1;
        if !entry.is_object() {
            warn!("Skipping accounts[{}]: not an object", position);
            continue;
        }
        let entry: AccountEntry = serde_json::from_value(entry)
            .map_err(|e| CrawlError::config(format!("accounts[{}]: {}", position, e)))?;
        match entry.into_account(position, default_qps)? {
            Some(account) => {
                if !names.insert(account.name.clone()) {
                    return Err(CrawlError::config(format!(
                        "duplicate account name: {}",
                        account.name
                    )));
                }
                accounts.push(account);
            }
            None => warn!("Skipping accounts[{}]: empty cookie", position),
        }
    }

    if accounts.is_empty() {
        return Err(CrawlError::config("accounts file has no entry with a cookie"));
    }
    Ok(accounts)
}
