//! Per-keyword processing outcome.

use serde_json::{json, Map, Value};

use super::KeywordStatus;

/// Payload keys always present, whatever endpoints are configured.
pub fn default_payload() -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("media_publish_count".into(), Value::Null);
    payload.insert("host".into(), Value::String(String::new()));
    payload.insert("publish_media_list".into(), Value::Array(Vec::new()));
    payload.insert("top_contributors".into(), Value::Array(Vec::new()));
    payload
}

fn display_name(item: &Value) -> Option<String> {
    ["screen_name", "name"]
        .iter()
        .filter_map(|k| item.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Name of the first media account, else of the first item of any list in the payload.
pub fn extract_host(payload: &Map<String, Value>) -> String {
    let first_of = |v: &Value| v.as_array().and_then(|a| a.first()).cloned();

    if let Some(first) = payload.get("publish_media_list").and_then(first_of) {
        if first.is_object() {
            return display_name(&first).unwrap_or_default();
        }
    }
    payload
        .values()
        .filter_map(first_of)
        .filter(Value::is_object)
        .find_map(|item| display_name(&item))
        .unwrap_or_default()
}

/// Result of processing one keyword. Never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub keyword: String,
    /// True when any configured endpoint produced items.
    pub found: bool,
    /// Endpoint outputs, totals and `host`.
    pub payload: Map<String, Value>,
    /// Account that produced the result, or the last one attempted on failure.
    pub account: Option<String>,
    pub ok: bool,
    pub error: Option<String>,
}

impl Outcome {
    /// Accepted result from `account`.
    pub fn accepted(
        keyword: &str,
        found: bool,
        payload: Map<String, Value>,
        account: &str,
    ) -> Self {
        Self {
            keyword: keyword.to_string(),
            found,
            payload,
            account: Some(account.to_string()),
            ok: true,
            error: None,
        }
    }

    /// Failure after every attempt was exhausted.
    pub fn failure(keyword: &str, account: Option<&str>, error: impl Into<String>) -> Self {
        Self {
            keyword: keyword.to_string(),
            found: false,
            payload: default_payload(),
            account: account.map(str::to_string),
            ok: false,
            error: Some(error.into()),
        }
    }

    /// Checkpoint status this outcome persists as.
    pub fn status(&self) -> KeywordStatus {
        if self.found {
            KeywordStatus::Success
        } else {
            KeywordStatus::Failed
        }
    }

    /// The public record: keyword, found and the payload. Internal fields are never included.
    pub fn public_payload(&self) -> Value {
        let mut out = Map::new();
        out.insert("keyword".into(), json!(self.keyword));
        out.insert("found".into(), json!(self.found));
        for (k, v) in &self.payload {
            out.insert(k.clone(), v.clone());
        }
        Value::Object(out)
    }
}
