//! Concurrent fetch-and-degrade scraper
//!
//! Fetches content for a candidate result set through the egress pool,
//! truncates it, and feeds success/failure back into the pool. Every
//! failure path degrades to a title-only entry; the output map always has
//! one entry per input candidate.
//!
//! Proxy scope: only links carrying an onion address are routed through
//! Tor. Clear-web links surfaced by an engine or chat provider are fetched
//! directly, unanonymized — deployers who consider that metadata leak
//! unacceptable should drop non-onion candidates before calling
//! [`ScrapeOrchestrator::scrape_all`].

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use magpie_core::{SearchResult, DEFAULT_MAX_CONTENT_CHARS, TRUNCATION_MARKER};
use magpie_tor::{
    direct_client, proxied_client, retry_with_backoff, CircuitController, EgressPool, FetchError,
};

/// Scraper configuration
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    /// Per-request timeout
    pub timeout: Duration,
    /// Maximum characters kept per page
    pub max_chars: usize,
    /// Whether circuit rotation is active
    pub rotate: bool,
    /// Rotate after every N overlay requests
    pub rotate_interval: u64,
    /// Also rotate immediately when an overlay request fails
    pub rotate_on_error: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(45),
            max_chars: DEFAULT_MAX_CONTENT_CHARS,
            rotate: false,
            rotate_interval: 5,
            rotate_on_error: true,
        }
    }
}

/// Shared rotation cadence: one trigger per `interval` requests.
///
/// The counter mutex is held only for the increment; the rotation itself
/// happens outside the lock.
pub struct RotationPolicy {
    counter: Mutex<u64>,
    interval: u64,
}

impl RotationPolicy {
    pub fn new(interval: u64) -> Self {
        Self {
            counter: Mutex::new(0),
            interval: interval.max(1),
        }
    }

    /// Count a request; true when this request crosses the interval
    pub fn note_request(&self) -> bool {
        let mut counter = self.counter.lock();
        *counter += 1;
        *counter % self.interval == 0
    }

    /// Requests counted so far
    pub fn requests(&self) -> u64 {
        *self.counter.lock()
    }
}

/// Fetches candidate pages concurrently and degrades on failure
#[derive(Clone)]
pub struct ScrapeOrchestrator {
    pool: Arc<EgressPool>,
    controller: Option<Arc<CircuitController>>,
    policy: Arc<RotationPolicy>,
    config: ScrapeConfig,
}

impl ScrapeOrchestrator {
    pub fn new(
        pool: Arc<EgressPool>,
        controller: Option<Arc<CircuitController>>,
        config: ScrapeConfig,
    ) -> Self {
        let policy = Arc::new(RotationPolicy::new(config.rotate_interval));
        Self {
            pool,
            controller,
            policy,
            config,
        }
    }

    /// Fetch all candidates concurrently.
    ///
    /// Returns one entry per input candidate keyed by link; candidates
    /// whose fetch failed (or whose worker died) fall back to their title.
    pub async fn scrape_all(
        &self,
        candidates: &[SearchResult],
        max_workers: usize,
    ) -> HashMap<String, String> {
        if candidates.is_empty() {
            warn!("No URLs provided for scraping");
            return HashMap::new();
        }

        info!(
            "Scraping {} URLs with {} workers",
            candidates.len(),
            max_workers
        );

        let tasks = candidates.iter().map(|candidate| {
            let this = self.clone();
            let candidate = candidate.clone();
            async move {
                let fallback = (candidate.link.clone(), candidate.title.clone());
                let worker = tokio::spawn(async move { this.scrape_one(candidate).await });
                match worker.await {
                    Ok(entry) => entry,
                    Err(e) => {
                        error!("Scrape worker died for {}: {}", fallback.0, e);
                        fallback
                    }
                }
            }
        });

        let entries: Vec<(String, String)> = stream::iter(tasks)
            .buffer_unordered(max_workers.max(1))
            .collect()
            .await;

        let mut results = HashMap::with_capacity(entries.len());
        for (url, content) in entries {
            results.insert(url, truncate_content(&content, self.config.max_chars));
        }

        info!("Scraped {} URLs", results.len());
        results
    }

    /// Fetch one candidate. Never fails: every error path returns the
    /// title as content.
    pub async fn scrape_one(&self, candidate: SearchResult) -> (String, String) {
        let url = candidate.link.clone();
        let title = candidate.title.clone();

        if url.is_empty() {
            warn!("Candidate {:?} has no URL", title);
            return (url, title);
        }

        // The source already delivered content (chat results); skip the fetch
        if let Some(content) = candidate.content.filter(|c| !c.is_empty()) {
            return (url, content);
        }

        let use_overlay = url.contains(".onion");
        let mut port_used = None;
        let proxy_url = if use_overlay {
            let port = self.pool.select_endpoint(None);
            port_used = Some(port);

            // Cadence counts overlay requests only
            if self.config.rotate && self.policy.note_request() {
                self.rotate_now().await;
            }

            Some(self.pool.proxy_url(port))
        } else {
            None
        };

        let timeout = self.config.timeout;
        let outcome = retry_with_backoff(2, 0.5, FetchError::is_transient, || {
            let url = url.clone();
            let proxy_url = proxy_url.clone();
            async move {
                let client = match &proxy_url {
                    Some(proxy) => proxied_client(proxy, timeout)?,
                    None => direct_client(timeout)?,
                };
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
                let text = page_text(&title, &html);
                debug!("Scraped {} ({} chars)", url, text.len());
                if let Some(port) = port_used {
                    self.pool.record_success(port);
                }
                (url, text)
            }
            Err(e) => {
                warn!("Failed to scrape {}: {}", url, e);
                if let Some(port) = port_used {
                    self.pool.record_failure(port);
                    if self.config.rotate && self.config.rotate_on_error {
                        self.rotate_now().await;
                    }
                }
                (url, title)
            }
        }
    }

    async fn rotate_now(&self) {
        let Some(controller) = &self.controller else {
            return;
        };
        if !controller.is_connected().await {
            return;
        }
        if controller.rotate_circuit().await {
            if let Some(exit) = controller.exit_identity().await {
                debug!(
                    "Using exit relay: {}",
                    exit.nickname.as_deref().unwrap_or("unknown")
                );
            }
        }
    }
}

/// Body text with script/style/noscript stripped, whitespace collapsed,
/// and the candidate title prefixed
fn page_text(title: &str, html: &str) -> String {
    use scraper::node::Node;

    let document = Html::parse_document(html);
    let body_selector = Selector::parse("body").unwrap();

    let mut parts: Vec<String> = Vec::new();
    if !title.is_empty() {
        parts.push(title.to_string());
    }

    if let Some(body) = document.select(&body_selector).next() {
        for node_ref in body.descendants() {
            if let Node::Text(text_node) = node_ref.value() {
                let in_excluded = node_ref.ancestors().any(|ancestor| {
                    ancestor
                        .value()
                        .as_element()
                        .map(|el| matches!(el.name(), "script" | "style" | "noscript"))
                        .unwrap_or(false)
                });
                if in_excluded {
                    continue;
                }

                let trimmed = text_node.trim();
                if !trimmed.is_empty() {
                    parts.push(trimmed.to_string());
                }
            }
        }
    }

    let joined = parts.join(" ");
    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cap content at `max_chars` characters, appending the truncation marker
/// when cut
fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let kept: String = content.chars().take(max_chars).collect();
    format!("{}{}", kept, TRUNCATION_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use magpie_tor::PoolConfig;

    fn orchestrator(config: ScrapeConfig) -> ScrapeOrchestrator {
        let pool = Arc::new(EgressPool::new(PoolConfig {
            start_port: 1,
            instances: 1,
            multi: false,
        }));
        ScrapeOrchestrator::new(pool, None, config)
    }

    #[test]
    fn test_rotation_cadence() {
        let policy = RotationPolicy::new(5);
        let rotations = (0..10).filter(|_| policy.note_request()).count();
        assert_eq!(rotations, 2);
        assert_eq!(policy.requests(), 10);
    }

    #[test]
    fn test_rotation_interval_floor() {
        let policy = RotationPolicy::new(0);
        assert!(policy.note_request());
    }

    #[test]
    fn test_page_text_strips_markup() {
        let html = r#"
            <html><body>
                <script>var x = 1;</script>
                <h1>Hello   World</h1>
                <p>Leaked  data here.</p>
                <style>.x { color: red; }</style>
            </body></html>
        "#;

        let text = page_text("Page Title", html);
        assert_eq!(text, "Page Title Hello World Leaked data here.");
    }

    #[test]
    fn test_truncate_content() {
        assert_eq!(truncate_content("short", 10), "short");
        let long = "x".repeat(20);
        let cut = truncate_content(&long, 10);
        assert_eq!(cut, format!("{}{}", "x".repeat(10), TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn test_scrape_degrades_to_title_on_failure() {
        // Connection refused on loopback; scrape_one must hand back the
        // title, not an error.
        let orchestrator = orchestrator(ScrapeConfig {
            timeout: Duration::from_millis(300),
            ..Default::default()
        });
        let candidate = SearchResult::new("Dead Site", "http://127.0.0.1:1/");

        let (url, content) = orchestrator.scrape_one(candidate).await;
        assert_eq!(url, "http://127.0.0.1:1/");
        assert_eq!(content, "Dead Site");
    }

    #[tokio::test]
    async fn test_prefilled_content_skips_fetch() {
        let orchestrator = orchestrator(ScrapeConfig::default());
        let candidate = SearchResult::new("Chat Post", "https://t.me/example/42")
            .with_content("message body already fetched");

        let (url, content) = orchestrator.scrape_one(candidate).await;
        assert_eq!(url, "https://t.me/example/42");
        assert_eq!(content, "message body already fetched");
    }

    #[tokio::test]
    async fn test_scrape_all_keeps_every_candidate() {
        let orchestrator = orchestrator(ScrapeConfig {
            timeout: Duration::from_millis(300),
            ..Default::default()
        });
        let candidates = vec![
            SearchResult::new("Prefilled", "http://a.example/").with_content("body"),
            SearchResult::new("Refused", "http://127.0.0.1:1/"),
        ];

        let results = orchestrator.scrape_all(&candidates, 2).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results["http://a.example/"], "body");
        assert_eq!(results["http://127.0.0.1:1/"], "Refused");
    }

    #[tokio::test]
    async fn test_scrape_all_truncates() {
        let orchestrator = orchestrator(ScrapeConfig {
            max_chars: 8,
            ..Default::default()
        });
        let candidates =
            vec![SearchResult::new("T", "http://a.example/").with_content("0123456789abcdef")];

        let results = orchestrator.scrape_all(&candidates, 1).await;
        assert_eq!(results["http://a.example/"], format!("01234567{}", TRUNCATION_MARKER));
    }
}
