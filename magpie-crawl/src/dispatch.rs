//! Multi-engine query dispatcher
//!
//! Fans a query out to every enabled engine (and, optionally, a chat
//! search collaborator) through the egress pool, isolates per-engine
//! failures, and merges the fan-in by link.

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use magpie_core::{dedupe_by_link, EngineDescriptor, SearchResult};
use magpie_tor::{
    check_tor_connection, proxied_client, retry_with_backoff, EgressPool, FetchError,
};

use crate::providers::ChatSearch;
use crate::registry::EngineRegistry;

/// Onion links inside result-page hrefs
static ONION_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^/]*\.onion[^\s<>"{}|\\^`\[\]]*"#).unwrap()
});

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Per-request timeout for engine queries
    pub search_timeout: Duration,
    /// Whether to run the Tor reachability check before dispatching
    pub verify_connection: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            search_timeout: Duration::from_secs(20),
            verify_connection: true,
        }
    }
}

/// Fans queries out across engines and merges the results
pub struct SearchDispatcher {
    pool: Arc<EgressPool>,
    registry: EngineRegistry,
    config: DispatchConfig,
}

impl SearchDispatcher {
    pub fn new(pool: Arc<EgressPool>, registry: EngineRegistry, config: DispatchConfig) -> Self {
        Self {
            pool,
            registry,
            config,
        }
    }

    /// Query all enabled engines concurrently.
    ///
    /// Every task's failure is isolated: a dead engine contributes zero
    /// results and does not cancel its siblings. Output order is fan-in
    /// completion order; callers treat it as a set keyed by link.
    pub async fn dispatch(
        &self,
        query: &str,
        max_workers: usize,
        chat: Option<&dyn ChatSearch>,
        skip_health_check: bool,
    ) -> Vec<SearchResult> {
        info!("Dispatching query: {}", query);

        if self.config.verify_connection
            && !check_tor_connection(&self.pool, Duration::from_secs(10)).await
        {
            warn!("Tor connection verification failed, continuing anyway");
        }

        let engines = self.registry.enabled_ordered(skip_health_check).await;
        info!("Using {} enabled search engines", engines.len());

        self.run_tasks(&engines, query, max_workers, chat).await
    }

    async fn run_tasks(
        &self,
        engines: &[&'static EngineDescriptor],
        query: &str,
        max_workers: usize,
        chat: Option<&dyn ChatSearch>,
    ) -> Vec<SearchResult> {
        let mut tasks: Vec<BoxFuture<'_, Vec<SearchResult>>> = engines
            .iter()
            .map(|&engine| self.engine_task(engine, query).boxed())
            .collect();

        if let Some(chat) = chat {
            if chat.is_configured() {
                tasks.push(
                    async move {
                        match chat.search(query, 50).await {
                            Ok(results) => results,
                            Err(e) => {
                                warn!("Chat search failed: {}", e);
                                Vec::new()
                            }
                        }
                    }
                    .boxed(),
                );
            }
        }

        let source_count = tasks.len();
        let batches: Vec<Vec<SearchResult>> = stream::iter(tasks)
            .buffer_unordered(max_workers.max(1))
            .collect()
            .await;

        let unique = dedupe_by_link(batches.into_iter().flatten().collect());
        info!(
            "Found {} unique results from {} source(s)",
            unique.len(),
            source_count
        );
        unique
    }

    async fn engine_task(
        &self,
        engine: &'static EngineDescriptor,
        query: &str,
    ) -> Vec<SearchResult> {
        match self.fetch_engine_results(engine, query).await {
            Ok(results) => results,
            Err(e) => {
                warn!("Engine {} failed: {}", engine.name, e);
                Vec::new()
            }
        }
    }

    /// One engine query: render the template, fetch through a pool proxy
    /// with transient-error retry, and parse out onion links.
    async fn fetch_engine_results(
        &self,
        engine: &EngineDescriptor,
        query: &str,
    ) -> Result<Vec<SearchResult>, FetchError> {
        let url = engine.build_url(query);
        let port = self.pool.select_endpoint(None);
        let proxy_url = self.pool.proxy_url(port);
        let timeout = self.config.search_timeout;

        let outcome = retry_with_backoff(3, 0.5, FetchError::is_transient, || {
            let url = url.clone();
            let proxy_url = proxy_url.clone();
            async move {
                let client = proxied_client(&proxy_url, timeout)?;
                let resp = client.get(&url).send().await.map_err(FetchError::classify)?;
                if !resp.status().is_success() {
                    return Err(FetchError::Status(resp.status().as_u16()));
                }
                resp.text().await.map_err(FetchError::classify)
            }
        })
        .await;

        match outcome {
            Ok(html) => {
                let results = parse_onion_links(&html, engine.id);
                debug!("Engine {} returned {} results", engine.name, results.len());
                self.pool.record_success(port);
                Ok(results)
            }
            Err(e) => {
                self.pool.record_failure(port);
                Err(e)
            }
        }
    }
}

/// Extract `{title, link}` pairs from anchors whose href carries an onion
/// address
fn parse_onion_links(html: &str, source: &str) -> Vec<SearchResult> {
    let document = Html::parse_document(html);
    let anchor = Selector::parse("a").unwrap();

    let mut results = Vec::new();
    for element in document.select(&anchor) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let title = element.text().collect::<String>().trim().to_string();
        if href.is_empty() || title.is_empty() {
            continue;
        }

        if let Some(m) = ONION_LINK_RE.find(href) {
            results.push(SearchResult::new(title, m.as_str()).with_source(source));
        }
    }

    results
}
