//! Per-keyword processing: account selection, retries, fallback and acceptance.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{CrawlError, Result};
use crate::models::{default_payload, extract_host, Account, ApiEndpoint, Outcome};
use crate::scrapers::{expand_query_variants, AccountClient, EndpointFetcher};
use crate::utils::stable_bucket;

/// Retry and fallback policy for [`KeywordProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Attempts over the whole account order.
    pub max_retries: u32,
    /// Only ever use the keyword's primary account.
    pub strict_account_isolation: bool,
    /// Try the other accounts, in rotation, after the primary.
    pub fallback_to_other_accounts: bool,
    /// Accept an empty contributors list as a real answer.
    pub allow_empty_contributors: bool,
    pub backoff_step: Duration,
    pub backoff_cap: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strict_account_isolation: false,
            fallback_to_other_accounts: true,
            allow_empty_contributors: false,
            backoff_step: Duration::from_millis(600),
            backoff_cap: Duration::from_secs(8),
        }
    }
}

impl ProcessorConfig {
    /// Whether accounts other than the primary may be tried.
    pub fn uses_fallback(&self) -> bool {
        self.fallback_to_other_accounts && !self.strict_account_isolation
    }

    /// Pause after a failed account attempt: `min(cap, step * attempt + jitter)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff_step.as_secs_f64() * f64::from(attempt) + rand::random::<f64>();
        Duration::from_secs_f64(base).min(self.backoff_cap)
    }
}

/// Runs one keyword against the account pool and produces its [`Outcome`].
pub struct KeywordProcessor {
    clients: Vec<Arc<AccountClient>>,
    fetcher: EndpointFetcher,
    endpoints: Vec<ApiEndpoint>,
    templates: Vec<String>,
    config: ProcessorConfig,
}

impl KeywordProcessor {
    pub fn new(
        clients: Vec<Arc<AccountClient>>,
        fetcher: EndpointFetcher,
        endpoints: Vec<ApiEndpoint>,
        templates: Vec<String>,
        config: ProcessorConfig,
    ) -> Result<Self> {
        if clients.is_empty() {
            return Err(CrawlError::config("at least one account is required"));
        }
        if endpoints.is_empty() {
            return Err(CrawlError::config("at least one endpoint is required"));
        }
        Ok(Self {
            clients,
            fetcher,
            endpoints,
            templates,
            config,
        })
    }

    pub fn clients(&self) -> &[Arc<AccountClient>] {
        &self.clients
    }

    /// The account behind the client called `name`.
    pub fn account_named(&self, name: &str) -> Option<&Account> {
        self.clients
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.account())
    }

    pub fn endpoints(&self) -> &[ApiEndpoint] {
        &self.endpoints
    }

    pub fn templates(&self) -> &[String] {
        &self.templates
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Index of the keyword's primary account. Stable across runs.
    pub fn primary_index(&self, keyword: &str) -> usize {
        stable_bucket(keyword, self.clients.len() as u64) as usize
    }

    /// Accounts to try, in order: the primary, then the rest in rotation
    /// unless fallback is disabled.
    pub fn account_order(&self, keyword: &str) -> Vec<usize> {
        let n = self.clients.len();
        let start = self.primary_index(keyword);
        let take = if self.config.uses_fallback() { n } else { 1 };
        (0..take).map(|i| (start + i) % n).collect()
    }

    /// Process one keyword. Never fails: errors become a failure outcome.
    pub async fn process(&self, keyword: &str) -> Outcome {
        let order = self.account_order(keyword);
        let variants = expand_query_variants(keyword, &self.templates);
        let mut last_error: Option<String> = None;
        let mut last_account: Option<&str> = None;

        for attempt in 1..=self.config.max_retries.max(1) {
            for &index in &order {
                let client = &self.clients[index];
                match self.try_account(client, keyword, &variants).await {
                    Ok(outcome) => return outcome,
                    Err(e) => {
                        debug!(
                            "keyword={} account={} attempt={} failed: {}",
                            keyword,
                            client.name(),
                            attempt,
                            e
                        );
                        last_account = Some(client.name());
                        let retryable = e.is_retryable();
                        last_error = Some(e.describe());
                        if !retryable {
                            warn!("keyword={} aborted: {}", keyword, e);
                            return Outcome::failure(keyword, last_account, e.describe());
                        }
                        tokio::time::sleep(self.config.backoff(attempt)).await;
                    }
                }
            }
        }

        Outcome::failure(
            keyword,
            last_account,
            last_error.unwrap_or_else(|| "unknown".to_string()),
        )
    }

    /// Run every variant through one account until one is accepted.
    ///
    /// A failing variant falls through to the next; the last variant's failure is returned.
    async fn try_account(
        &self,
        client: &AccountClient,
        keyword: &str,
        variants: &[String],
    ) -> Result<Outcome> {
        let mut last_error = CrawlError::EmptyResult(format!("query variants for '{}'", keyword));
        for query in variants {
            match self.fetch_variant(client, query).await {
                Ok(payload) => {
                    let found = self.endpoints.iter().any(|endpoint| {
                        payload
                            .get(&endpoint.output_field)
                            .and_then(Value::as_array)
                            .is_some_and(|items| !items.is_empty())
                    });
                    return Ok(Outcome::accepted(keyword, found, payload, client.name()));
                }
                Err(e) => {
                    debug!("{} variant '{}' rejected: {}", client.name(), query, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Fetch every endpoint for one query and apply the acceptance policy.
    async fn fetch_variant(&self, client: &AccountClient, query: &str) -> Result<Map<String, Value>> {
        let mut payload = default_payload();
        for endpoint in &self.endpoints {
            let result = self.fetcher.fetch_all(client, query, endpoint).await?;
            if endpoint.requires_items()
                && result.items.is_empty()
                && !self.config.allow_empty_contributors
            {
                return Err(CrawlError::EmptyResult(endpoint.name.clone()));
            }
            payload.insert(endpoint.output_field.clone(), Value::Array(result.items));
            if let Some(field) = &endpoint.total_field {
                payload.insert(field.clone(), result.total.map_or(Value::Null, Value::from));
            }
        }
        let host = extract_host(&payload);
        payload.insert("host".into(), Value::String(host));
        Ok(payload)
    }
}
