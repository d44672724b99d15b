//! Query variants submitted for a keyword.

use crate::error::{CrawlError, Result};

/// Placeholder replaced by the keyword in a query template.
pub const KEYWORD_PLACEHOLDER: &str = "{keyword}";

/// Templates used when none are configured: the hashtag form first, then the bare keyword.
pub const DEFAULT_QUERY_TEMPLATES: &[&str] = &["#{keyword}#", "{keyword}"];

/// Trim and deduplicate configured templates, preserving order.
///
/// No templates at all selects the defaults; templates that are all blank are an error.
pub fn normalize_templates<S: AsRef<str>>(raw: &[S]) -> Result<Vec<String>> {
    if raw.is_empty() {
        return Ok(DEFAULT_QUERY_TEMPLATES
            .iter()
            .map(|t| t.to_string())
            .collect());
    }

    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for template in raw {
        let template = template.as_ref().trim();
        if !template.is_empty() && !out.iter().any(|t| t == template) {
            out.push(template.to_string());
        }
    }
    if out.is_empty() {
        return Err(CrawlError::config("query templates must not be empty"));
    }
    Ok(out)
}

/// Render `keyword` into each template, keeping the first occurrence of each
/// distinct non-empty result.
pub fn expand_query_variants<S: AsRef<str>>(keyword: &str, templates: &[S]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(templates.len());
    for template in templates {
        let query = template.as_ref().replace(KEYWORD_PLACEHOLDER, keyword);
        let query = query.trim();
        if !query.is_empty() && !out.iter().any(|q| q == query) {
            out.push(query.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_variants() {
        let templates = normalize_templates::<&str>(&[]).unwrap();
        assert_eq!(
            expand_query_variants("coffee", &templates),
            vec!["#coffee#", "coffee"]
        );
    }

    #[test]
    fn test_duplicate_renders_are_dropped() {
        let templates = ["{keyword}", " {keyword} ", "{keyword}", "#{keyword}#"];
        assert_eq!(
            expand_query_variants("tea", &templates),
            vec!["tea", "#tea#"]
        );
    }

    #[test]
    fn test_blank_keyword_yields_only_decorated_forms() {
        assert_eq!(
            expand_query_variants("", &["{keyword}", "#{keyword}#"]),
            vec!["##"]
        );
        assert!(expand_query_variants("  ", &["{keyword}"]).is_empty());
    }

    #[test]
    fn test_normalize_templates() {
        assert_eq!(
            normalize_templates(&[" a ", "b", "a", ""]).unwrap(),
            vec!["a", "b"]
        );
        assert!(matches!(
            normalize_templates(&["  ", ""]),
            Err(CrawlError::Config(_))
        ));
    }
}
