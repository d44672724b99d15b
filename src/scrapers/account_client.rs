//! One account's paced JSON client.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::http_client::{JsonResponse, Transport};
use super::rate_limiter::RequestPacer;
use crate::error::{CrawlError, Result};
use crate::models::Account;
use crate::utils::append_jsonl;

/// Status and error number the platform uses for a risk-control block.
pub const RISK_CONTROL_SENTINEL: i64 = -100;

/// Append-only JSONL record of every API call, shared by all accounts.
#[derive(Clone)]
pub struct AuditLog {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    ts: i64,
    account: &'a str,
    url: &'a str,
    status_code: Option<u16>,
    payload: &'a Value,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn record(&self, account: &str, url: &str, status_code: Option<u16>, payload: &Value) {
        let record = AuditRecord {
            ts: Utc::now().timestamp(),
            account,
            url,
            status_code,
            payload,
        };
        let _guard = self.write_lock.lock().await;
        if let Err(e) = append_jsonl(&self.path, &record) {
            warn!("Failed to append audit record to {}: {}", self.path.display(), e);
        }
    }
}

fn is_sentinel(value: Option<&Value>) -> bool {
    value.and_then(Value::as_i64) == Some(RISK_CONTROL_SENTINEL)
        || value.and_then(Value::as_f64) == Some(RISK_CONTROL_SENTINEL as f64)
}

fn field_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
        None => "null".to_string(),
    }
}

/// Classify a JSON payload by its embedded status fields.
///
/// `ok == -100` or `errno == -100` is a risk-control block; a negative numeric
/// `ok` or a negative integer `errno` is an API error.
pub fn check_payload(url: &str, payload: &Value) -> Result<()> {
    let Some(obj) = payload.as_object() else {
        return Ok(());
    };
    let ok = obj.get("ok");
    let errno = obj.get("errno");

    if is_sentinel(ok) || is_sentinel(errno) {
        return Err(CrawlError::RiskControlBlocked {
            url: url.to_string(),
        });
    }

    let ok_negative = ok.and_then(Value::as_f64).is_some_and(|v| v < 0.0);
    let errno_negative = errno.and_then(Value::as_i64).is_some_and(|v| v < 0);
    if ok_negative || errno_negative {
        return Err(CrawlError::Api {
            ok: field_text(ok),
            errno: field_text(errno),
            url: url.to_string(),
        });
    }
    Ok(())
}

/// Paced client owning one account for the process lifetime.
pub struct AccountClient {
    account: Account,
    transport: Arc<dyn Transport>,
    pacer: RequestPacer,
    audit: Option<AuditLog>,
}

impl AccountClient {
    pub fn new(account: Account, transport: Arc<dyn Transport>) -> Self {
        let pacer = RequestPacer::new(account.name.clone(), account.qps);
        Self {
            account,
            transport,
            pacer,
            audit: None,
        }
    }

    /// Record every call to `audit`.
    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn name(&self) -> &str {
        &self.account.name
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn pacer(&self) -> &RequestPacer {
        &self.pacer
    }

    /// Fetch `url` in this account's next slot and validate the payload.
    pub async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self.pacer.pace(|| self.transport.get_json(url)).await;

        let JsonResponse {
            status_code,
            payload,
        } = match response {
            Ok(response) => response,
            Err(e) => {
                debug!("{} transport failure for {}: {}", self.account.name, url, e);
                if let Some(audit) = &self.audit {
                    let detail = serde_json::json!({ "error": e.to_string() });
                    audit.record(&self.account.name, url, None, &detail).await;
                }
                return Err(e);
            }
        };

        if let Some(audit) = &self.audit {
            audit
                .record(&self.account.name, url, Some(status_code), &payload)
                .await;
        }

        if !(200..300).contains(&status_code) {
            return Err(CrawlError::Transport(format!(
                "HTTP {} from {}",
                status_code, url
            )));
        }
        check_payload(url, &payload)?;
        Ok(payload)
    }
}
