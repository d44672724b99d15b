//! JSON transport used by account clients.
//!
//! [`Transport`] is the seam between the crawl engine and the network: the
//! engine only needs "GET this URL, give me the status and the JSON body".
//! [`HttpTransport`] is the reqwest implementation, one per account so that
//! cookies and headers never leak between identities.

mod headers;

pub use headers::{browser_header_pairs, browser_headers, is_chromium, origin_from_referer};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::Client;
use serde_json::Value;
use url::Url;

use crate::error::{CrawlError, Result};
use crate::models::Account;

/// A response whose body parsed as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonResponse {
    pub status_code: u16,
    pub payload: Value,
}

impl JsonResponse {
    pub fn new(status_code: u16, payload: Value) -> Self {
        Self {
            status_code,
            payload,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Fetches a URL and returns its JSON body.
///
/// Implementations return `Ok` for any response whose body is JSON, whatever
/// the status code, and [`CrawlError::Transport`] for everything else.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<JsonResponse>;
}

/// reqwest-backed transport carrying one account's headers and cookies.
pub struct HttpTransport {
    client: Client,
}

/// Load a raw `a=1; b=2` cookie string into a jar scoped to `base`.
fn cookie_jar(cookie: &str, base: &Url) -> Jar {
    let jar = Jar::default();
    for part in cookie.split(';') {
        let Some((name, value)) = part.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        jar.add_cookie_str(&format!("{}={}; Path=/", name, value.trim()), base);
    }
    jar
}

impl HttpTransport {
    /// Build the transport for `account` against `api_base`.
    pub fn for_account(account: &Account, timeout: Duration, api_base: &str) -> Result<Self> {
        let base = Url::parse(api_base)
            .map_err(|e| CrawlError::config(format!("invalid API base '{}': {}", api_base, e)))?;
        let jar = Arc::new(cookie_jar(&account.cookie, &base));

        let client = Client::builder()
            .default_headers(browser_headers(account)?)
            .cookie_provider(jar)
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_json(&self, url: &str) -> Result<JsonResponse> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        match serde_json::from_slice::<Value>(&body) {
            Ok(payload) => Ok(JsonResponse::new(status.as_u16(), payload)),
            Err(_) if !status.is_success() => Err(CrawlError::Transport(format!(
                "HTTP {} from {}",
                status.as_u16(),
                url
            ))),
            Err(e) => Err(CrawlError::Transport(format!(
                "invalid JSON from {}: {}",
                url, e
            ))),
        }
    }
}
