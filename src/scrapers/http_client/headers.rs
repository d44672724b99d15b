//! Browser-like request headers for account sessions.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::error::{CrawlError, Result};
use crate::models::Account;

const DEFAULT_ORIGIN: &str = "https://m.weibo.cn";
const FALLBACK_CHROME_MAJOR: &str = "121";

static CHROME_VERSION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Chrome/(\d+)").unwrap());

/// Whether the user agent is a Chromium build that sends client hints.
pub fn is_chromium(user_agent: &str) -> bool {
    user_agent.contains("Chrome/")
        && !user_agent.contains("Edg/")
        && !user_agent.contains("OPR/")
        && !user_agent.contains("CriOS/")
}

pub fn is_mobile(user_agent: &str) -> bool {
    ["Mobile", "Android", "iPhone", "iPad"]
        .iter()
        .any(|marker| user_agent.contains(marker))
}

/// Platform name as reported by `sec-ch-ua-platform`.
pub fn platform(user_agent: &str) -> &'static str {
    if user_agent.contains("Android") {
        "Android"
    } else if user_agent.contains("iPhone") || user_agent.contains("iPad") {
        "iOS"
    } else if user_agent.contains("Mac OS X") {
        "macOS"
    } else if user_agent.contains("Windows") {
        "Windows"
    } else {
        "Linux"
    }
}

fn chrome_major(user_agent: &str) -> String {
    CHROME_VERSION
        .captures(user_agent)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| FALLBACK_CHROME_MAJOR.to_string())
}

/// `scheme://host[:port]` of the referer, else the mobile site origin.
pub fn origin_from_referer(referer: &str) -> String {
    Url::parse(referer.trim())
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(|u| u.origin().ascii_serialization())
        .filter(|origin| origin != "null")
        .unwrap_or_else(|| DEFAULT_ORIGIN.to_string())
}

/// Client hints matching a Chromium user agent.
pub fn chromium_client_hints(user_agent: &str) -> Vec<(&'static str, String)> {
    let major = chrome_major(user_agent);
    vec![
        (
            "sec-ch-ua",
            format!(
                r#""Not.A/Brand";v="99", "Chromium";v="{major}", "Google Chrome";v="{major}""#
            ),
        ),
        (
            "sec-ch-ua-mobile",
            if is_mobile(user_agent) { "?1" } else { "?0" }.to_string(),
        ),
        ("sec-ch-ua-platform", format!("\"{}\"", platform(user_agent))),
    ]
}

/// Header pairs sent with every request of `account`.
///
/// Encoding and connection headers are left to the HTTP client.
pub fn browser_header_pairs(account: &Account) -> Vec<(&'static str, String)> {
    let ua = account.user_agent.as_str();
    let mut pairs = vec![
        ("user-agent", ua.to_string()),
        ("accept", "application/json, text/plain, */*".to_string()),
        ("accept-language", account.accept_language.clone()),
        ("referer", account.referer.clone()),
        ("origin", origin_from_referer(&account.referer)),
        ("pragma", "no-cache".to_string()),
        ("cache-control", "no-cache".to_string()),
        ("x-requested-with", "XMLHttpRequest".to_string()),
        ("sec-fetch-site", "same-origin".to_string()),
        ("sec-fetch-mode", "cors".to_string()),
        ("sec-fetch-dest", "empty".to_string()),
    ];
    if is_chromium(ua) {
        pairs.extend(chromium_client_hints(ua));
        pairs.push(("priority", "u=1, i".to_string()));
    }
    pairs
}

/// [`browser_header_pairs`] as a header map, rejecting values that are not valid header text.
pub fn browser_headers(account: &Account) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in browser_header_pairs(account) {
        let value = HeaderValue::from_str(&value).map_err(|_| {
            CrawlError::config(format!(
                "account {}: invalid value for header {}",
                account.name, name
            ))
        })?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_WIN: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
        (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
    const EDGE_WIN: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
        (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0";

    #[test]
    fn test_safari_default_has_no_client_hints() {
        let account = Account::new("acc1", "SUB=x", 1.0);
        let headers = browser_headers(&account).unwrap();
        assert!(headers.get("sec-ch-ua").is_none());
        assert!(headers.get("priority").is_none());
        assert_eq!(headers["origin"], "https://m.weibo.cn");
        assert_eq!(headers["x-requested-with"], "XMLHttpRequest");
    }

    #[test]
    fn test_chromium_client_hints() {
        let mut account = Account::new("acc1", "SUB=x", 1.0);
        account.user_agent = CHROME_WIN.to_string();
        let headers = browser_headers(&account).unwrap();
        assert_eq!(
            headers["sec-ch-ua"],
            r#""Not.A/Brand";v="99", "Chromium";v="131", "Google Chrome";v="131""#
        );
        assert_eq!(headers["sec-ch-ua-mobile"], "?0");
        assert_eq!(headers["sec-ch-ua-platform"], "\"Windows\"");
        assert_eq!(headers["priority"], "u=1, i");
    }

    #[test]
    fn test_chrome_major_extraction() {
        assert_eq!(chrome_major(CHROME_WIN), "131");
        assert_eq!(chrome_major(EDGE_WIN), "131");
        assert_eq!(chrome_major("curl/8.0"), "121");
    }

    #[test]
    fn test_edge_is_not_treated_as_chrome() {
        assert!(is_chromium(CHROME_WIN));
        assert!(!is_chromium(EDGE_WIN));
    }

    #[test]
    fn test_origin_from_referer() {
        assert_eq!(
            origin_from_referer("https://weibo.com/u/123?x=1"),
            "https://weibo.com"
        );
        assert_eq!(
            origin_from_referer("http://127.0.0.1:8080/a"),
            "http://127.0.0.1:8080"
        );
        assert_eq!(origin_from_referer("not a url"), "https://m.weibo.cn");
    }

    #[test]
    fn test_invalid_header_value_is_config_error() {
        let mut account = Account::new("acc1", "SUB=x", 1.0);
        account.user_agent = "bad\nagent".to_string();
        assert!(matches!(
            browser_headers(&account),
            Err(CrawlError::Config(_))
        ));
    }
}
