//! Egress pool of Tor SOCKS ports
//!
//! Round-robins requests across the configured local proxy ports, tracks
//! per-port statistics, and keeps a short-lived reachability cache. The
//! pool is fail-open: when every port looks unhealthy the full set is
//! still offered, so crawling degrades instead of halting.

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::client::{proxied_client, TOR_CHECK_URL};

/// How long a reachability probe result stays valid
const HEALTH_CACHE_TTL: Duration = Duration::from_secs(60);

/// Timeout for a single reachability probe
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pool configuration, fixed at construction
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// First SOCKS port
    pub start_port: u16,
    /// Number of sequential ports when multi-instance mode is on
    pub instances: usize,
    /// Whether to spread load across multiple Tor instances
    pub multi: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            start_port: 9050,
            instances: 3,
            multi: false,
        }
    }
}

/// Cached health verdict for an egress port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Per-port request statistics
#[derive(Debug, Clone, Default)]
pub struct EndpointStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_used: Option<Instant>,
    pub health: EndpointHealth,
}

/// Pool of Tor egress ports
pub struct EgressPool {
    ports: Vec<u16>,
    cursor: Mutex<usize>,
    stats: DashMap<u16, EndpointStats>,
    health_cache: DashMap<u16, (Instant, bool)>,
}

impl EgressPool {
    /// Build the pool; single-instance mode pins the size to 1
    pub fn new(config: PoolConfig) -> Self {
        let count = if config.multi {
            config.instances.max(1)
        } else {
            1
        };
        let ports: Vec<u16> = (0..count as u16)
            .map(|i| config.start_port + i)
            .collect();

        let stats = DashMap::new();
        for &port in &ports {
            stats.insert(port, EndpointStats::default());
        }

        info!("Egress pool: {} port(s) starting at {}", ports.len(), config.start_port);

        Self {
            ports,
            cursor: Mutex::new(0),
            stats,
            health_cache: DashMap::new(),
        }
    }

    /// Configured ports, in order
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Next egress port.
    ///
    /// A known `preferred` port is returned as-is; otherwise round-robin
    /// advances under the cursor mutex (held only for the index update)
    /// and the selection is counted against the port's statistics.
    pub fn select_endpoint(&self, preferred: Option<u16>) -> u16 {
        if let Some(port) = preferred {
            if self.ports.contains(&port) {
                return port;
            }
        }

        let port = {
            let mut cursor = self.cursor.lock();
            let port = self.ports[*cursor];
            *cursor = (*cursor + 1) % self.ports.len();
            port
        };

        if let Some(mut entry) = self.stats.get_mut(&port) {
            entry.requests += 1;
            entry.last_used = Some(Instant::now());
        }

        port
    }

    /// SOCKS5h proxy URL for a port
    pub fn proxy_url(&self, port: u16) -> String {
        format!("socks5h://127.0.0.1:{}", port)
    }

    /// Count a successful request against a port
    pub fn record_success(&self, port: u16) {
        if let Some(mut entry) = self.stats.get_mut(&port) {
            entry.successes += 1;
            entry.health = EndpointHealth::Healthy;
        }
    }

    /// Count a failed request against a port; flips to Unhealthy past a
    /// 50% failure rate
    pub fn record_failure(&self, port: u16) {
        if let Some(mut entry) = self.stats.get_mut(&port) {
            entry.failures += 1;
            if entry.requests >= 1 {
                let rate = entry.failures as f64 / entry.requests as f64;
                if rate > 0.5 {
                    entry.health = EndpointHealth::Unhealthy;
                }
            }
        }
    }

    /// Probe one port against the reachability check URL; the verdict is
    /// cached for [`HEALTH_CACHE_TTL`]
    pub async fn health_check_port(&self, port: u16, timeout: Duration) -> bool {
        if let Some(cached) = self.health_cache.get(&port) {
            let (checked_at, result) = *cached;
            if checked_at.elapsed() < HEALTH_CACHE_TTL {
                return result;
            }
        }

        let healthy = match proxied_client(&self.proxy_url(port), timeout) {
            Ok(client) => match client.get(TOR_CHECK_URL).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(e) => {
                    debug!("Health check failed for port {}: {}", port, e);
                    false
                }
            },
            Err(_) => false,
        };

        self.health_cache.insert(port, (Instant::now(), healthy));
        if let Some(mut entry) = self.stats.get_mut(&port) {
            entry.health = if healthy {
                EndpointHealth::Healthy
            } else {
                EndpointHealth::Unhealthy
            };
        }

        healthy
    }

    /// Probe every port concurrently
    pub async fn health_check_all(&self, timeout: Duration) -> HashMap<u16, bool> {
        let probes = self
            .ports
            .iter()
            .map(|&port| async move { (port, self.health_check_port(port, timeout).await) });

        let results: HashMap<u16, bool> = join_all(probes).await.into_iter().collect();
        let healthy = results.values().filter(|&&v| v).count();
        info!("Health check complete: {}/{} ports healthy", healthy, self.ports.len());

        results
    }

    /// Ports currently believed healthy; Unknown ports are probed first.
    /// Falls back to the full port list when nothing qualifies.
    pub async fn healthy_endpoints(&self) -> Vec<u16> {
        let mut healthy = Vec::new();

        for &port in &self.ports {
            let status = self
                .stats
                .get(&port)
                .map(|entry| entry.health)
                .unwrap_or_default();

            match status {
                EndpointHealth::Healthy => healthy.push(port),
                EndpointHealth::Unknown => {
                    if self.health_check_port(port, HEALTH_PROBE_TIMEOUT).await {
                        healthy.push(port);
                    }
                }
                EndpointHealth::Unhealthy => {}
            }
        }

        if healthy.is_empty() {
            self.ports.clone()
        } else {
            healthy
        }
    }

    /// Snapshot of per-port statistics
    pub fn statistics(&self) -> HashMap<u16, EndpointStats> {
        self.stats
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Clear statistics and cached health verdicts
    pub fn reset_statistics(&self) {
        for &port in &self.ports {
            self.stats.insert(port, EndpointStats::default());
        }
        self.health_cache.clear();
        *self.cursor.lock() = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi_pool() -> EgressPool {
        EgressPool::new(PoolConfig {
            start_port: 19050,
            instances: 3,
            multi: true,
        })
    }

    #[test]
    fn test_round_robin_visits_each_port_once() {
        let pool = multi_pool();
        let mut seen: Vec<u16> = (0..3).map(|_| pool.select_endpoint(None)).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![19050, 19051, 19052]);

        // Next cycle starts over from the first port
        assert_eq!(pool.select_endpoint(None), 19050);
    }

    #[test]
    fn test_single_instance_mode() {
        let pool = EgressPool::new(PoolConfig::default());
        assert_eq!(pool.ports(), &[9050]);
        assert_eq!(pool.select_endpoint(None), 9050);
        assert_eq!(pool.select_endpoint(None), 9050);
    }

    #[test]
    fn test_preferred_port_returned_when_known() {
        let pool = multi_pool();
        assert_eq!(pool.select_endpoint(Some(19052)), 19052);
        // Unknown preference falls back to round-robin
        assert_eq!(pool.select_endpoint(Some(1)), 19050);
    }

    #[test]
    fn test_selection_counts_requests() {
        let pool = multi_pool();
        pool.select_endpoint(None);
        let stats = pool.statistics();
        assert_eq!(stats[&19050].requests, 1);
        assert!(stats[&19050].last_used.is_some());
    }

    #[test]
    fn test_failure_rate_threshold() {
        let pool = multi_pool();

        // Four round-robin selections put two requests on 19050; two
        // failures against it is a 100% failure rate.
        for _ in 0..4 {
            pool.select_endpoint(None);
        }
        pool.record_failure(19050);
        pool.record_failure(19050);
        assert_eq!(pool.statistics()[&19050].requests, 2);
        assert_eq!(pool.statistics()[&19050].health, EndpointHealth::Unhealthy);
    }

    #[test]
    fn test_exactly_half_failures_does_not_flip() {
        let pool = multi_pool();

        // Two requests against 19051, one failure: exactly 50%
        pool.select_endpoint(None); // 19050
        pool.select_endpoint(None); // 19051
        pool.select_endpoint(None); // 19052
        pool.select_endpoint(None); // 19050
        pool.select_endpoint(None); // 19051 again
        pool.record_failure(19051);
        assert_eq!(pool.statistics()[&19051].failures, 1);
        assert_eq!(pool.statistics()[&19051].requests, 2);
        assert_ne!(pool.statistics()[&19051].health, EndpointHealth::Unhealthy);
    }

    #[test]
    fn test_success_marks_healthy() {
        let pool = multi_pool();
        pool.select_endpoint(None);
        pool.record_success(19050);
        assert_eq!(pool.statistics()[&19050].health, EndpointHealth::Healthy);
    }

    #[tokio::test]
    async fn test_fail_open_when_all_unhealthy() {
        let pool = multi_pool();

        for _ in 0..3 {
            pool.select_endpoint(None);
        }
        for port in [19050, 19051, 19052] {
            pool.record_failure(port);
        }
        let stats = pool.statistics();
        assert!(stats.values().all(|s| s.health == EndpointHealth::Unhealthy));

        let healthy = pool.healthy_endpoints().await;
        assert_eq!(healthy, vec![19050, 19051, 19052]);
    }

    #[tokio::test]
    async fn test_health_cache_skips_second_probe() {
        let pool = multi_pool();

        // Seed the cache; a live probe against this port would fail (nothing
        // listens on 19050 here), so getting `true` back proves the cached
        // verdict was used.
        pool.health_cache.insert(19050, (Instant::now(), true));
        assert!(pool.health_check_port(19050, Duration::from_millis(200)).await);
    }

    #[test]
    fn test_reset_statistics() {
        let pool = multi_pool();
        pool.select_endpoint(None);
        pool.record_failure(19050);
        pool.reset_statistics();

        let stats = pool.statistics();
        assert_eq!(stats[&19050].requests, 0);
        assert_eq!(stats[&19050].health, EndpointHealth::Unknown);
        assert_eq!(pool.select_endpoint(None), 19050);
    }
}
