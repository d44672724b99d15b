//! Paginated API endpoint descriptors.

use std::collections::HashSet;

use serde::Deserialize;

use crate::error::{CrawlError, Result};

/// Placeholder every resource template must contain.
pub const QUERY_PLACEHOLDER: &str = "{q}";

/// Payload field whose empty list is never accepted as a final answer.
pub const CONTRIBUTORS_FIELD: &str = "top_contributors";

/// Closed set of item mappers an endpoint can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemParser {
    /// `{uid, screen_name}` per user card.
    UsersBasic,
    /// `{rank, uid, name, contribution_value}` per user card.
    Contributors,
    /// Raw card objects.
    RawCards,
}

impl ItemParser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UsersBasic => "users_basic",
            Self::Contributors => "contributors",
            Self::RawCards => "raw_cards",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "users_basic" => Some(Self::UsersBasic),
            "contributors" => Some(Self::Contributors),
            "raw_cards" => Some(Self::RawCards),
            _ => None,
        }
    }
}

/// A configured, paginated resource shape to collect items from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoint {
    pub name: String,
    /// Resource selector containing `{q}`; `{query}` and `{keyword}` are also substituted.
    pub resource_template: String,
    pub parser: ItemParser,
    /// Payload key the items are written under. Unique across endpoints.
    pub output_field: String,
    /// Payload key for the reported total, if the endpoint has one.
    pub total_field: Option<String>,
    pub max_pages: u32,
}

impl ApiEndpoint {
    /// Endpoints writing [`CONTRIBUTORS_FIELD`], whose empty result is treated as
    /// unreliable data rather than a real answer. The parser does not matter.
    pub fn requires_items(&self) -> bool {
        self.output_field == CONTRIBUTORS_FIELD
    }
}

struct Builtin {
    name: &'static str,
    template: &'static str,
    parser: ItemParser,
    output_field: &'static str,
    total_field: Option<&'static str>,
}

const BUILTINS: &[Builtin] = &[
    Builtin {
        name: "media",
        template: "100103type=164&q={q}&t=3",
        parser: ItemParser::UsersBasic,
        output_field: "publish_media_list",
        total_field: Some("media_publish_count"),
    },
    Builtin {
        name: "contributors",
        template: "231522type=103&q={q}",
        parser: ItemParser::Contributors,
        output_field: "top_contributors",
        total_field: None,
    },
];

fn builtin(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.name == name)
}

/// Page caps applied when an entry does not set `max_pages`.
#[derive(Debug, Clone, Copy)]
pub struct PageDefaults {
    pub media: u32,
    pub contributors: u32,
}

impl Default for PageDefaults {
    fn default() -> Self {
        Self {
            media: 12,
            contributors: 3,
        }
    }
}

impl PageDefaults {
    fn for_name(&self, name: &str) -> u32 {
        match name {
            "media" => self.media,
            "contributors" => self.contributors,
            _ => 1,
        }
    }
}

/// Object form of an endpoint entry. Missing fields fall back to the built-in of the same name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointEntry {
    pub name: Option<String>,
    pub builtin: Option<String>,
    #[serde(alias = "containerid")]
    pub containerid_template: Option<String>,
    pub parser: Option<String>,
    pub output_field: Option<String>,
    /// `Some("")` explicitly disables a built-in total.
    pub total_field: Option<String>,
    pub max_pages: Option<u32>,
}

/// One element of the endpoint list: a built-in name or a full object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EndpointSpec {
    Builtin(String),
    Custom(EndpointEntry),
}

fn from_builtin_name(raw: &str, pages: &PageDefaults) -> Result<ApiEndpoint> {
    let name = raw.trim().to_ascii_lowercase();
    let base = builtin(&name)
        .ok_or_else(|| CrawlError::config(format!("unknown built-in endpoint: {}", raw)))?;
    Ok(ApiEndpoint {
        name: base.name.to_string(),
        resource_template: base.template.to_string(),
        parser: base.parser,
        output_field: base.output_field.to_string(),
        total_field: base.total_field.map(str::to_string),
        max_pages: pages.for_name(base.name).max(1),
    })
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn from_entry(entry: &EndpointEntry, position: usize, pages: &PageDefaults) -> Result<ApiEndpoint> {
    let name = trimmed(&entry.name)
        .or_else(|| trimmed(&entry.builtin))
        .map(|n| n.to_ascii_lowercase());
    let base = name.as_deref().and_then(builtin);

    let template = trimmed(&entry.containerid_template)
        .or_else(|| base.map(|b| b.template.to_string()))
        .ok_or_else(|| {
            CrawlError::config(format!(
                "endpoint[{}] is missing containerid_template",
                position
            ))
        })?;
    if !template.contains(QUERY_PLACEHOLDER) {
        return Err(CrawlError::config(format!(
            "endpoint[{}] containerid_template must contain '{}'",
            position, QUERY_PLACEHOLDER
        )));
    }

    let parser_name = trimmed(&entry.parser);
    let parser = match parser_name {
        Some(p) => ItemParser::from_str(&p).ok_or_else(|| {
            CrawlError::config(format!("endpoint[{}] has unsupported parser: {}", position, p))
        })?,
        None => base.map(|b| b.parser).ok_or_else(|| {
            CrawlError::config(format!("endpoint[{}] is missing parser", position))
        })?,
    };

    let output_field = trimmed(&entry.output_field)
        .or_else(|| base.map(|b| b.output_field.to_string()))
        .ok_or_else(|| {
            CrawlError::config(format!("endpoint[{}] is missing output_field", position))
        })?;

    let total_field = match &entry.total_field {
        Some(_) => trimmed(&entry.total_field),
        None => base.and_then(|b| b.total_field).map(str::to_string),
    };

    let name = name.unwrap_or_else(|| format!("custom_{}", position));
    let max_pages = entry
        .max_pages
        .unwrap_or_else(|| pages.for_name(&name))
        .max(1);

    Ok(ApiEndpoint {
        name,
        resource_template: template,
        parser,
        output_field,
        total_field,
        max_pages,
    })
}

/// Validate and resolve the configured endpoint list.
///
/// An empty list resolves to the `media` and `contributors` built-ins.
pub fn resolve_endpoints(specs: &[EndpointSpec], pages: &PageDefaults) -> Result<Vec<ApiEndpoint>> {
    let defaults;
    let specs = if specs.is_empty() {
        defaults = vec![
            EndpointSpec::Builtin("media".to_string()),
            EndpointSpec::Builtin("contributors".to_string()),
        ];
        &defaults
    } else {
        specs
    };

    let mut endpoints = Vec::with_capacity(specs.len());
    let mut output_fields = HashSet::new();
    for (i, spec) in specs.iter().enumerate() {
        let endpoint = match spec {
            EndpointSpec::Builtin(name) => from_builtin_name(name, pages)?,
            EndpointSpec::Custom(entry) => from_entry(entry, i + 1, pages)?,
        };
        if !output_fields.insert(endpoint.output_field.clone()) {
            return Err(CrawlError::config(format!(
                "duplicate endpoint output_field: {}",
                endpoint.output_field
            )));
        }
        endpoints.push(endpoint);
    }
    Ok(endpoints)
}
