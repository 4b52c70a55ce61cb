//! Search result records
//!
//! Results from every source (onion engines, chat search) share one shape
//! and merge by link.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A single search hit. Identity is the `link`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchResult {
    /// Result title (anchor text or message preview)
    pub title: String,
    /// Result URL, the unique key
    pub link: String,
    /// Pre-fetched content, if the source already had it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Which source produced this result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl SearchResult {
    pub fn new(title: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
            content: None,
            source: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Deduplicate results by link, keeping the first occurrence.
///
/// Input order is fan-in completion order, so "first" is whichever source
/// finished first; callers must treat the output as a set keyed by link.
pub fn dedupe_by_link(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut unique = Vec::with_capacity(results.len());

    for result in results {
        if result.link.is_empty() {
            continue;
        }
        if seen.insert(result.link.clone()) {
            unique.push(result);
        }
    }

    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_keeps_first_title() {
        let results = vec![
            SearchResult::new("First Title", "http://abc.onion/"),
            SearchResult::new("Second Title", "http://abc.onion/"),
            SearchResult::new("Other", "http://xyz.onion/"),
        ];

        let unique = dedupe_by_link(results);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].title, "First Title");
        assert_eq!(unique[1].link, "http://xyz.onion/");
    }

    #[test]
    fn test_dedupe_skips_empty_links() {
        let results = vec![
            SearchResult::new("No Link", ""),
            SearchResult::new("Real", "http://abc.onion/"),
        ];

        let unique = dedupe_by_link(results);
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].title, "Real");
    }
}
