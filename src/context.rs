//! Wiring of a crawl run from resolved [`Settings`].

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::config::Settings;
use crate::error::Result;
use crate::models::{load_accounts, load_keywords, Account};
use crate::repository::CheckpointStore;
use crate::scrapers::endpoint::EndpointFetcher;
use crate::scrapers::{AccountClient, AuditLog, HttpTransport, Transport};
use crate::services::{
    ChallengeResolver, CrawlScheduler, GateRegistry, KeywordProcessor, PlatformResolver,
    ShutdownSignal,
};

/// Everything a crawl needs, built once at startup.
pub struct CrawlContext {
    pub settings: Settings,
    pub keywords: Vec<String>,
    pub store: Arc<Mutex<CheckpointStore>>,
    pub processor: Arc<KeywordProcessor>,
    pub gates: Arc<GateRegistry>,
}

impl CrawlContext {
    /// Load the input files and connect real HTTP transports and browser automation.
    pub fn build(settings: Settings) -> Result<Self> {
        let keywords = load_keywords(
            &settings.csv,
            settings.keyword_column.as_deref(),
            settings.limit,
            settings.shard,
        )?;
        let accounts = load_accounts(&settings.accounts, settings.default_qps)?;

        let timeout = settings.timeout;
        let api_base = settings.api_base.clone();
        Self::assemble(
            settings,
            keywords,
            accounts,
            |account| {
                let transport = HttpTransport::for_account(account, timeout, &api_base)?;
                Ok(Arc::new(transport) as Arc<dyn Transport>)
            },
            Arc::new(PlatformResolver::new()),
        )
    }

    /// Build from already-loaded inputs with caller-supplied collaborators.
    pub fn assemble<F>(
        settings: Settings,
        keywords: Vec<String>,
        accounts: Vec<Account>,
        transport_for: F,
        resolver: Arc<dyn ChallengeResolver>,
    ) -> Result<Self>
    where
        F: Fn(&Account) -> Result<Arc<dyn Transport>>,
    {
        let store = CheckpointStore::open(&settings.state_db, Some(settings.output.as_path()))?;

        let audit = settings.raw_log.clone().map(AuditLog::new);
        let mut clients = Vec::with_capacity(accounts.len());
        for account in accounts {
            let transport = transport_for(&account)?;
            let mut client = AccountClient::new(account, transport);
            if let Some(audit) = &audit {
                client = client.with_audit_log(audit.clone());
            }
            clients.push(Arc::new(client));
        }

        let processor = KeywordProcessor::new(
            clients,
            EndpointFetcher::new(settings.api_base.clone()),
            settings.endpoints.clone(),
            settings.query_templates.clone(),
            settings.processor.clone(),
        )?;
        let gates = GateRegistry::new(settings.gate.clone(), resolver);

        Ok(Self {
            settings,
            keywords,
            store: Arc::new(Mutex::new(store)),
            processor: Arc::new(processor),
            gates: Arc::new(gates),
        })
    }

    pub fn scheduler(&self, shutdown: ShutdownSignal) -> CrawlScheduler {
        CrawlScheduler::new(
            self.processor.clone(),
            self.store.clone(),
            self.gates.clone(),
            self.settings.scheduler.clone(),
        )
        .with_shutdown(shutdown)
    }

    /// Input keywords already persisted as done.
    pub async fn done_count(&self) -> Result<usize> {
        let done = self.store.lock().await.list_done()?;
        Ok(self.keywords.iter().filter(|k| done.contains(*k)).count())
    }

    /// Log the one-time run summary.
    pub fn log_startup(&self, done: usize, workers: usize) {
        let settings = &self.settings;
        let mode = if workers > 1 {
            format!("parallel({})", workers)
        } else {
            "serial".to_string()
        };
        let shard = settings
            .shard
            .map(|s| s.to_string())
            .unwrap_or_else(|| "all".to_string());
        let endpoints: Vec<String> = settings
            .endpoints
            .iter()
            .map(|e| format!("{}:{}:{}p", e.name, e.output_field, e.max_pages))
            .collect();

        info!(
            "keywords={} done={} todo={} accounts={} mode={} shard={}",
            self.keywords.len(),
            done,
            self.keywords.len() - done,
            self.processor.clients().len(),
            mode,
            shard
        );
        info!(
            "isolation={} fallback={} endpoints={} templates={}",
            settings.processor.strict_account_isolation,
            settings.processor.uses_fallback(),
            endpoints.join(","),
            settings.query_templates.join(" | ")
        );
    }
}
