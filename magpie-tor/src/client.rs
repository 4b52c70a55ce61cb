//! HTTP client construction and failure classification
//!
//! Builds reqwest clients routed through a SOCKS5h egress proxy (DNS
//! resolution happens inside Tor) or directly for clear-web URLs, and maps
//! reqwest failures onto the transient/permanent taxonomy the retry layer
//! and the pool statistics consume.

use reqwest::{Client, Proxy};
use std::time::Duration;
use thiserror::Error;

use crate::pool::EgressPool;

/// Reachability probe target for egress health checks
pub const TOR_CHECK_URL: &str = "http://check.torproject.org/";

/// Errors from fetch operations, classified for retry and stats decisions
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Request failed: {0}")]
    Other(String),
}

impl FetchError {
    /// Transient failures are worth retrying; HTTP statuses and client
    /// construction errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout(_) | FetchError::Connect(_) | FetchError::Proxy(_)
        )
    }

    /// Map a reqwest error onto the taxonomy
    pub fn classify(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else if err.is_connect() {
            // SOCKS handshake failures surface as connect errors; keep the
            // proxy wording when the chain mentions it.
            let msg = err.to_string();
            if msg.contains("proxy") || msg.contains("socks") {
                FetchError::Proxy(msg)
            } else {
                FetchError::Connect(msg)
            }
        } else if let Some(status) = err.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Other(err.to_string())
        }
    }
}

/// User agents for rotation
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:137.0) Gecko/20100101 Firefox/137.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.7; rv:137.0) Gecko/20100101 Firefox/137.0",
    "Mozilla/5.0 (X11; Linux i686; rv:137.0) Gecko/20100101 Firefox/137.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_7_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.3 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36 Edg/135.0.3179.54",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36 Edg/135.0.3179.54",
];

/// Pick a random user agent
pub fn random_user_agent() -> &'static str {
    use rand::Rng;
    let idx = rand::thread_rng().gen_range(0..USER_AGENTS.len());
    USER_AGENTS[idx]
}

/// Build an HTTP client routed through the given SOCKS5h proxy URL
pub fn proxied_client(proxy_url: &str, timeout: Duration) -> Result<Client, FetchError> {
    let proxy = Proxy::all(proxy_url).map_err(|e| FetchError::ClientBuild(e.to_string()))?;

    Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .user_agent(random_user_agent())
        .danger_accept_invalid_certs(true) // many hidden services run self-signed certs
        .build()
        .map_err(|e| FetchError::ClientBuild(e.to_string()))
}

/// Build a direct (unproxied) HTTP client for clear-web URLs
pub fn direct_client(timeout: Duration) -> Result<Client, FetchError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(random_user_agent())
        .build()
        .map_err(|e| FetchError::ClientBuild(e.to_string()))
}

/// Check whether Tor is reachable through the pool's next egress port.
///
/// Degraded-but-running is the normal state for this stack, so the check
/// reports rather than fails: callers log a warning and continue.
pub async fn check_tor_connection(pool: &EgressPool, timeout: Duration) -> bool {
    let port = pool.select_endpoint(None);
    let client = match proxied_client(&pool.proxy_url(port), timeout) {
        Ok(client) => client,
        Err(_) => return false,
    };

    match client.get(TOR_CHECK_URL).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_user_agent() {
        let ua = random_user_agent();
        assert!(ua.contains("Mozilla"));
    }

    #[test]
    fn test_proxied_client_builds() {
        let client = proxied_client("socks5h://127.0.0.1:9050", Duration::from_secs(5));
        assert!(client.is_ok());
    }

    #[test]
    fn test_transient_classes() {
        assert!(FetchError::Timeout("t".into()).is_transient());
        assert!(FetchError::Connect("c".into()).is_transient());
        assert!(FetchError::Proxy("p".into()).is_transient());
        assert!(!FetchError::Status(503).is_transient());
        assert!(!FetchError::Other("o".into()).is_transient());
    }
}
