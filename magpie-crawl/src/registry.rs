//! Health-aware view over the engine catalog
//!
//! Wraps the static descriptor catalog with a TTL-cached liveness probe so
//! the dispatcher can schedule healthy engines first without re-probing on
//! every query.

use dashmap::DashMap;
use reqwest::redirect::Policy;
use reqwest::{Client, Proxy};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use magpie_core::{engines_by_priority, EngineDescriptor};
use magpie_tor::{random_user_agent, EgressPool};

/// How long a probe verdict stays valid
const ENGINE_HEALTH_TTL: Duration = Duration::from_secs(300);

/// Timeout for a single probe request
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry over the static catalog plus cached engine health
pub struct EngineRegistry {
    pool: Arc<EgressPool>,
    health_cache: DashMap<&'static str, (Instant, bool)>,
}

impl EngineRegistry {
    pub fn new(pool: Arc<EgressPool>) -> Self {
        Self {
            pool,
            health_cache: DashMap::new(),
        }
    }

    /// Enabled engines, ascending priority. Unless skipped, engines are
    /// partitioned healthy-first with relative priority order preserved
    /// inside each partition.
    pub async fn enabled_ordered(
        &self,
        skip_health_check: bool,
    ) -> Vec<&'static EngineDescriptor> {
        let ordered = engines_by_priority();
        if skip_health_check {
            return ordered;
        }

        let mut healthy = Vec::new();
        let mut unhealthy = Vec::new();
        for engine in ordered {
            if self.probe_health(engine).await {
                healthy.push(engine);
            } else {
                unhealthy.push(engine);
            }
        }

        healthy.extend(unhealthy);
        healthy
    }

    /// Probe one engine with a throwaway query through a pool proxy.
    ///
    /// 200 means alive; 403/404 mean the service exists but rejected the
    /// probe, which is still schedulable. Redirects are not followed.
    /// Verdicts are cached for [`ENGINE_HEALTH_TTL`].
    pub async fn probe_health(&self, engine: &'static EngineDescriptor) -> bool {
        if !engine.enabled {
            return false;
        }

        if let Some(cached) = self.health_cache.get(engine.id) {
            let (checked_at, result) = *cached;
            if checked_at.elapsed() < ENGINE_HEALTH_TTL {
                return result;
            }
        }

        let healthy = self.probe_uncached(engine).await;
        self.health_cache.insert(engine.id, (Instant::now(), healthy));
        healthy
    }

    async fn probe_uncached(&self, engine: &EngineDescriptor) -> bool {
        let url = engine.build_url("test");
        let port = self.pool.select_endpoint(None);

        let client = match probe_client(&self.pool.proxy_url(port)) {
            Ok(client) => client,
            Err(_) => return false,
        };

        match client.get(&url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                matches!(status, 200 | 403 | 404)
            }
            Err(e) => {
                debug!("Health probe failed for {}: {}", engine.id, e);
                false
            }
        }
    }
}

fn probe_client(proxy_url: &str) -> Result<Client, reqwest::Error> {
    let proxy = Proxy::all(proxy_url)?;
    Client::builder()
        .proxy(proxy)
        .timeout(PROBE_TIMEOUT)
        .redirect(Policy::none())
        .user_agent(random_user_agent())
        .danger_accept_invalid_certs(true)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use magpie_core::ENGINE_CATALOG;
    use magpie_tor::PoolConfig;

    fn registry() -> EngineRegistry {
        EngineRegistry::new(Arc::new(EgressPool::new(PoolConfig {
            start_port: 1,
            instances: 1,
            multi: false,
        })))
    }

    #[tokio::test]
    async fn test_skip_health_check_returns_priority_order() {
        let registry = registry();
        let engines = registry.enabled_ordered(true).await;
        assert!(engines.windows(2).all(|w| w[0].priority <= w[1].priority));
        assert_eq!(engines[0].id, "ahmia");
    }

    #[tokio::test]
    async fn test_probe_uses_cached_verdict() {
        let registry = registry();
        let engine = &ENGINE_CATALOG[0];

        // A live probe through port 1 would fail; a cached `true` coming
        // back proves the network check ran zero times.
        registry
            .health_cache
            .insert(engine.id, (Instant::now(), true));
        assert!(registry.probe_health(engine).await);
    }

    #[tokio::test]
    async fn test_healthy_engines_sort_first() {
        let registry = registry();
        let now = Instant::now();

        // Seed verdicts: ahmia (priority 1) down, everything else up.
        for engine in ENGINE_CATALOG {
            registry
                .health_cache
                .insert(engine.id, (now, engine.id != "ahmia"));
        }

        let engines = registry.enabled_ordered(false).await;
        assert_eq!(engines.last().unwrap().id, "ahmia");
        // Remaining priority-1 engines still precede priority-2 ones
        assert_eq!(engines[0].priority, 1);
    }
}
