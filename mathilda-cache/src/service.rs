//! Cache service composition root.
//!
//! The host builds one [`CacheService`] at startup and shares it. It owns
//! the cache client, the TTL policy, the slow-query observer and the domain
//! helpers, and hands out wrapped executors for data access.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use mathilda_core::{
    CacheConfig, Clock, Feature, MathildaResult, RuntimeCapabilities, SystemClock, TtlPolicy,
};

use crate::backend::ConnectionState;
use crate::client::{build_cache_client, CacheClient, CacheStats};
use crate::domain::DomainCache;
use crate::invalidation::Invalidator;
use crate::observer::{ObservedExecutor, SlowQueryLog, SlowQueryObserver, SlowQuerySink};
use crate::query::{CachingExecutor, QueryExecutor};

/// Slow queries kept in memory for later inspection.
const SLOW_QUERY_LOG_CAPACITY: usize = 200;

const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub struct CacheService {
    config: CacheConfig,
    capabilities: RuntimeCapabilities,
    client: Arc<CacheClient>,
    policy: Arc<TtlPolicy>,
    observer: Arc<SlowQueryObserver>,
    slow_queries: Arc<SlowQueryLog>,
    domain: DomainCache,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("client", &self.client)
            .field("observer", &self.observer)
            .finish_non_exhaustive()
    }
}

impl CacheService {
    /// Build the service with the system clock and the standard TTL policy.
    pub fn new(config: CacheConfig, capabilities: RuntimeCapabilities) -> MathildaResult<Self> {
        Self::with_clock(config, capabilities, Arc::new(SystemClock))
    }

    /// Configuration from the environment, capabilities of this process.
    pub fn from_env() -> MathildaResult<Self> {
        Self::new(CacheConfig::from_env(), *RuntimeCapabilities::current())
    }

    pub fn with_clock(
        config: CacheConfig,
        capabilities: RuntimeCapabilities,
        clock: Arc<dyn Clock>,
    ) -> MathildaResult<Self> {
        let client = Arc::new(build_cache_client(&config, &capabilities, clock)?);
        let policy = Arc::new(TtlPolicy::standard());
        let slow_queries = Arc::new(SlowQueryLog::new(SLOW_QUERY_LOG_CAPACITY));
        let observer = Arc::new(
            SlowQueryObserver::new(config.slow_query_threshold)
                .with_sink(slow_queries.clone())
                .with_metrics(Arc::clone(client.metrics())),
        );
        let domain = DomainCache::new(Arc::clone(&client), Arc::clone(&policy));

        Ok(Self {
            config,
            capabilities,
            client,
            policy,
            observer,
            slow_queries,
            domain,
        })
    }

    /// Replace the TTL policy.
    pub fn with_policy(mut self, policy: TtlPolicy) -> Self {
        self.policy = Arc::new(policy);
        self.domain = DomainCache::new(Arc::clone(&self.client), Arc::clone(&self.policy));
        self
    }

    /// Report slow queries to an additional sink.
    pub fn with_slow_query_sink(mut self, sink: Arc<dyn SlowQuerySink>) -> Self {
        self.observer = Arc::new(
            SlowQueryObserver::new(self.config.slow_query_threshold)
                .with_sink(self.slow_queries.clone())
                .with_sink(sink)
                .with_metrics(Arc::clone(self.client.metrics())),
        );
        self
    }

    /// Start connecting the distributed store. Returns immediately; calls
    /// are served from the fallback until the connection is up.
    pub fn connect(&self) {
        self.capabilities.if_runtime_supports(
            Feature::DistributedCache,
            || {
                self.client.connect();
                Ok::<(), Infallible>(())
            },
            (),
        );
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    /// Wait until the distributed store is connected, up to `timeout`.
    ///
    /// In-memory services are always ready.
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        let ready = || self.client.connection_state() == ConnectionState::Connected;
        tokio::time::timeout(timeout, async {
            while !ready() {
                tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok()
    }

    /// Wrap a raw executor: observed, then cached.
    pub fn data_access<E: QueryExecutor>(&self, executor: E) -> ObservedExecutor<CachingExecutor<E>> {
        let cached = CachingExecutor::new(executor, Arc::clone(&self.client), Arc::clone(&self.policy))
            .with_invalidate_on_write(self.config.invalidate_on_write);
        ObservedExecutor::new(cached, Arc::clone(&self.observer))
    }

    pub fn client(&self) -> &Arc<CacheClient> {
        &self.client
    }

    pub fn domain(&self) -> &DomainCache {
        &self.domain
    }

    pub fn invalidator(&self) -> &Invalidator {
        self.domain.invalidator()
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &RuntimeCapabilities {
        &self.capabilities
    }

    pub fn slow_queries(&self) -> &Arc<SlowQueryLog> {
        &self.slow_queries
    }

    pub fn stats(&self) -> CacheStats {
        self.client.stats()
    }

    /// Prometheus text exposition of the service's metrics.
    pub fn metrics_text(&self) -> MathildaResult<String> {
        self.client.metrics().encode()
    }
}
