//! End-to-end investigation pipeline
//!
//! refine -> dispatch -> relevance filter -> scrape -> indicator
//! extraction -> summary. Every stage degrades rather than aborts, except
//! a summarizer that keeps failing past its retry budget.

use std::collections::HashMap;
use thiserror::Error;
use tracing::{info, warn};

use magpie_core::{extract, merge, IndicatorMap, SearchResult};
use magpie_tor::retry_with_backoff;

use crate::dispatch::SearchDispatcher;
use crate::providers::{ChatSearch, QueryTransform, TransformError};
use crate::scrape::ScrapeOrchestrator;

/// Pipeline knobs
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Worker-pool size for search and scrape fan-out
    pub max_workers: usize,
    /// Results kept after relevance filtering
    pub top_n: usize,
    /// Skip the engine health check for faster startup
    pub skip_health_check: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: magpie_core::DEFAULT_MAX_WORKERS,
            top_n: magpie_core::DEFAULT_TOP_N,
            skip_health_check: false,
        }
    }
}

/// Everything one investigation produced
#[derive(Debug)]
pub struct Investigation {
    pub query: String,
    pub refined_query: String,
    pub results: Vec<SearchResult>,
    pub content: HashMap<String, String>,
    pub indicators: IndicatorMap,
    pub summary: String,
}

/// Pipeline-level failures
#[derive(Debug, Error)]
pub enum CrawlError {
    /// No source produced a single result; there was nothing to scrape
    #[error("no search results for query {0:?}")]
    EmptyInvestigation(String),

    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Run a full investigation.
///
/// Degraded intermediate outcomes (dead engines, title-only content,
/// failed refinement) are absorbed; only an entirely empty result set or
/// a persistently failing summarizer surface as errors.
pub async fn investigate(
    query: &str,
    dispatcher: &SearchDispatcher,
    scraper: &ScrapeOrchestrator,
    transform: &dyn QueryTransform,
    chat: Option<&dyn ChatSearch>,
    config: &PipelineConfig,
) -> Result<Investigation, CrawlError> {
    let refined_query = match transform.refine(query).await {
        Ok(refined) if !refined.is_empty() => refined,
        Ok(_) => {
            warn!("Refinement returned nothing, using the original query");
            query.to_string()
        }
        Err(e) => {
            warn!("Query refinement failed ({}), using the original query", e);
            query.to_string()
        }
    };

    let results = dispatcher
        .dispatch(&refined_query, config.max_workers, chat, config.skip_health_check)
        .await;
    if results.is_empty() {
        return Err(CrawlError::EmptyInvestigation(refined_query));
    }

    let selected = match transform
        .filter_relevant(&refined_query, &results, config.top_n)
        .await
    {
        Ok(selected) if !selected.is_empty() => selected,
        Ok(_) => results.iter().take(config.top_n).cloned().collect(),
        Err(e) => {
            warn!(
                "Relevance filter failed ({}), keeping the first {} results",
                e, config.top_n
            );
            results.iter().take(config.top_n).cloned().collect()
        }
    };
    info!("Investigating {} of {} results", selected.len(), results.len());

    let content = scraper.scrape_all(&selected, config.max_workers).await;

    let indicators = merge(content.values().map(|text| extract(text, None)));

    let summary = retry_with_backoff(2, 2.0, |_: &TransformError| true, || {
        transform.summarize(&refined_query, &content)
    })
    .await?;

    Ok(Investigation {
        query: query.to_string(),
        refined_query,
        results,
        content,
        indicators,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchConfig;
    use crate::registry::EngineRegistry;
    use crate::scrape::ScrapeConfig;
    use async_trait::async_trait;
    use magpie_tor::{EgressPool, PoolConfig};
    use std::sync::Arc;
    use std::time::Duration;

    struct StaticTransform;

    #[async_trait]
    impl QueryTransform for StaticTransform {
        async fn refine(&self, query: &str) -> Result<String, TransformError> {
            Ok(format!("{} refined", query))
        }

        async fn filter_relevant(
            &self,
            _query: &str,
            results: &[SearchResult],
            top_n: usize,
        ) -> Result<Vec<SearchResult>, TransformError> {
            Ok(results.iter().take(top_n).cloned().collect())
        }

        async fn summarize(
            &self,
            _query: &str,
            _content: &HashMap<String, String>,
        ) -> Result<String, TransformError> {
            Ok("summary".to_string())
        }
    }

    fn loopback_stack() -> (SearchDispatcher, ScrapeOrchestrator) {
        // Port 1 refuses connections, so every network path degrades fast
        let pool = Arc::new(EgressPool::new(PoolConfig {
            start_port: 1,
            instances: 1,
            multi: false,
        }));
        let dispatcher = SearchDispatcher::new(
            pool.clone(),
            EngineRegistry::new(pool.clone()),
            DispatchConfig {
                search_timeout: Duration::from_millis(200),
                verify_connection: false,
            },
        );
        let scraper = ScrapeOrchestrator::new(
            pool,
            None,
            ScrapeConfig {
                timeout: Duration::from_millis(200),
                ..Default::default()
            },
        );
        (dispatcher, scraper)
    }

    #[tokio::test]
    async fn test_all_engines_dead_is_meaningfully_empty() {
        let (dispatcher, scraper) = loopback_stack();
        let config = PipelineConfig {
            max_workers: 16,
            skip_health_check: true,
            ..Default::default()
        };

        let outcome = investigate(
            "ransomware payments",
            &dispatcher,
            &scraper,
            &StaticTransform,
            None,
            &config,
        )
        .await;

        match outcome {
            Err(CrawlError::EmptyInvestigation(query)) => {
                assert_eq!(query, "ransomware payments refined");
            }
            other => panic!("expected EmptyInvestigation, got {:?}", other.map(|i| i.summary)),
        }
    }
}
