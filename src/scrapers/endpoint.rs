//! Endpoint pagination and card parsing.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::account_client::AccountClient;
use crate::error::Result;
use crate::models::{ApiEndpoint, ItemParser};

/// Container listing endpoint of the mobile API.
pub const DEFAULT_API_BASE: &str = "https://m.weibo.cn/api/container/getIndex";

static ITEMID_UID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"uid=(\d+)").unwrap());

static FIRST_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]+(?:\.[0-9]+)?").unwrap());

/// Items collected for one endpoint and query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointItems {
    pub items: Vec<Value>,
    /// Total reported by the first page that carried one.
    pub total: Option<i64>,
    /// Pages requested.
    pub pages: u32,
}

/// A user entry found in a card group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCard {
    pub uid: String,
    pub screen_name: String,
    pub desc1: String,
}

/// Substitute a query into a resource template.
///
/// `{q}` and `{query}` receive the percent-encoded query, `{keyword}` the raw one.
pub fn render_resource(template: &str, query: &str) -> String {
    let encoded = urlencoding::encode(query);
    template
        .replace("{q}", &encoded)
        .replace("{query}", &encoded)
        .replace("{keyword}", query)
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn uid_from_itemid(itemid: Option<&Value>) -> Option<String> {
    let itemid = itemid?.as_str()?;
    ITEMID_UID
        .captures(itemid)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Collect user entries from the `card_group` of each card, first occurrence per uid.
///
/// An entry qualifies when its `card_type` is 10 or 11 or it carries a `user`
/// object. The uid comes from `user.id`, else from `uid=<digits>` in `itemid`.
pub fn parse_card_group_users(cards: &[Value]) -> Vec<UserCard> {
    let mut seen = HashSet::new();
    let mut users = Vec::new();

    let groups = cards
        .iter()
        .filter_map(|card| card.get("card_group").and_then(Value::as_array))
        .flatten()
        .filter_map(Value::as_object);

    for entry in groups {
        let user = entry.get("user").and_then(Value::as_object);
        let card_type = entry.get("card_type").and_then(Value::as_i64);
        if !matches!(card_type, Some(10 | 11)) && user.is_none() {
            continue;
        }

        let mut uid = text_of(user.and_then(|u| u.get("id")));
        if uid.is_empty() || uid == "0" {
            uid = uid_from_itemid(entry.get("itemid")).unwrap_or_default();
        }
        if uid.is_empty() || !seen.insert(uid.clone()) {
            continue;
        }

        users.push(UserCard {
            uid,
            screen_name: text_of(user.and_then(|u| u.get("screen_name"))),
            desc1: text_of(entry.get("desc1")),
        });
    }
    users
}

/// First number in `text`: an integer when integral, a float otherwise, null when absent.
pub fn parse_number_from_text(text: &str) -> Value {
    let Some(m) = FIRST_NUMBER.find(text) else {
        return Value::Null;
    };
    let raw = m.as_str();
    match raw.parse::<f64>() {
        Ok(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => json!(f as i64),
        Ok(f) => json!(f),
        Err(_) => Value::String(raw.to_string()),
    }
}

fn map_user(parser: ItemParser, user: &UserCard, rank: usize) -> Value {
    match parser {
        ItemParser::Contributors => json!({
            "rank": rank,
            "uid": user.uid,
            "name": user.screen_name,
            "contribution_value": parse_number_from_text(&user.desc1),
        }),
        _ => json!({
            "uid": user.uid,
            "screen_name": user.screen_name,
        }),
    }
}

fn raw_card_identity(card: &Map<String, Value>) -> String {
    match card.get("itemid").and_then(Value::as_str) {
        Some(itemid) if !itemid.is_empty() => format!("itemid:{}", itemid),
        _ => format!("json:{}", Value::Object(card.clone())),
    }
}

/// Paginates configured endpoints through an account client.
#[derive(Debug, Clone)]
pub struct EndpointFetcher {
    api_base: String,
}

impl Default for EndpointFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_API_BASE)
    }
}

impl EndpointFetcher {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// URL of one page of `endpoint` for `query`.
    pub fn build_url(&self, query: &str, page: u32, endpoint: &ApiEndpoint) -> String {
        let resource = render_resource(&endpoint.resource_template, query);
        let separator = if self.api_base.contains('?') { '&' } else { '?' };
        format!(
            "{}{}containerid={}&page={}",
            self.api_base,
            separator,
            urlencoding::encode(&resource),
            page
        )
    }

    /// Collect every item of `endpoint` for `query`.
    ///
    /// Pages run from 1 to `max_pages` and stop early at the first page that
    /// contributes no unseen item, or whose `data` is not an object. Fetch
    /// errors propagate; a malformed page only ends pagination.
    pub async fn fetch_all(
        &self,
        client: &AccountClient,
        query: &str,
        endpoint: &ApiEndpoint,
    ) -> Result<EndpointItems> {
        let mut result = EndpointItems::default();
        let mut seen: HashSet<String> = HashSet::new();

        for page in 1..=endpoint.max_pages.max(1) {
            let url = self.build_url(query, page, endpoint);
            let payload = client.get_json(&url).await?;
            result.pages = page;

            let Some(data) = payload.get("data").and_then(Value::as_object) else {
                debug!(
                    "{}: page {} of '{}' has no data object, stopping",
                    endpoint.name, page, query
                );
                break;
            };

            if result.total.is_none() {
                result.total = data
                    .get("cardlistInfo")
                    .and_then(|info| info.get("total"))
                    .and_then(Value::as_i64);
            }

            let cards: &[Value] = data
                .get("cards")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();

            let mut added = 0usize;
            match endpoint.parser {
                ItemParser::RawCards => {
                    for card in cards.iter().filter_map(Value::as_object) {
                        if seen.insert(raw_card_identity(card)) {
                            result.items.push(Value::Object(card.clone()));
                            added += 1;
                        }
                    }
                }
                parser => {
                    for user in parse_card_group_users(cards) {
                        if seen.insert(user.uid.clone()) {
                            let rank = result.items.len() + 1;
                            result.items.push(map_user(parser, &user, rank));
                            added += 1;
                        }
                    }
                }
            }

            debug!(
                "{}: page {} of '{}' added {} items",
                endpoint.name, page, query, added
            );
            if added == 0 {
                break;
            }
        }

        Ok(result)
    }
}
