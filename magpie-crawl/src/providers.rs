//! Collaborator seams consumed by the pipeline
//!
//! The core treats query refinement/filtering/summarization and chat
//! search as pluggable providers. Wire-level details of any particular
//! provider live behind these traits.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use magpie_core::SearchResult;

/// Errors from transform providers
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Empty response")]
    EmptyResponse,
}

/// Text-transform collaborator backed by any language model provider.
///
/// Pipeline fallback policy: a failed `refine` falls back to the original
/// query, a failed `filter_relevant` falls back to the first N results,
/// and `summarize` failures propagate once the retry budget is spent.
#[async_trait]
pub trait QueryTransform: Send + Sync {
    /// Rewrite a user query into search-engine-friendly terms
    async fn refine(&self, query: &str) -> Result<String, TransformError>;

    /// Re-rank results by relevance and keep the top `top_n`
    async fn filter_relevant(
        &self,
        query: &str,
        results: &[SearchResult],
        top_n: usize,
    ) -> Result<Vec<SearchResult>, TransformError>;

    /// Produce an investigation summary from scraped content keyed by URL
    async fn summarize(
        &self,
        query: &str,
        content: &HashMap<String, String>,
    ) -> Result<String, TransformError>;
}

/// Errors from chat-search providers
#[derive(Debug, Error)]
pub enum ChatSearchError {
    #[error("Chat search error: {0}")]
    Provider(String),

    #[error("Chat search not configured")]
    NotConfigured,
}

/// External chat-platform search collaborator.
///
/// Results use the same shape as engine results; `content`, when present,
/// lets the scraper skip the fetch for that link.
#[async_trait]
pub trait ChatSearch: Send + Sync {
    /// Whether credentials/configuration are in place
    fn is_configured(&self) -> bool;

    /// Search public messages for a query
    async fn search(&self, query: &str, limit: usize)
        -> Result<Vec<SearchResult>, ChatSearchError>;
}
