//! Prometheus Metrics Definitions
//!
//! Each cache service owns its own [`Registry`], so several services (and
//! tests) can coexist in one process without clashing registrations.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

use mathilda_core::{MathildaError, MathildaResult};

/// Query latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s
const QUERY_LATENCY_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0];

/// Container for all cache metrics.
#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,

    /// Cache lookups - labels: category, result (hit/miss)
    pub requests_total: IntCounterVec,

    /// Distributed backend failures - labels: operation
    pub backend_errors_total: IntCounterVec,

    /// Calls served by the in-process store
    pub fallback_operations_total: IntCounter,

    /// Data-access call duration - labels: entity, action
    pub query_duration_seconds: HistogramVec,

    /// Calls over the slow-query threshold - labels: entity
    pub slow_queries_total: IntCounterVec,
}

impl std::fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMetrics").finish_non_exhaustive()
    }
}

fn telemetry_error(name: &str, e: prometheus::Error) -> MathildaError {
    MathildaError::Telemetry {
        reason: format!("Failed to register {}: {}", name, e),
    }
}

impl CacheMetrics {
    /// Create and register all metrics in a fresh registry.
    pub fn new() -> MathildaResult<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("mathilda_cache_requests_total", "Total number of cache lookups"),
            &["category", "result"],
        )
        .map_err(|e| telemetry_error("requests_total", e))?;

        let backend_errors_total = IntCounterVec::new(
            Opts::new(
                "mathilda_cache_backend_errors_total",
                "Total number of distributed cache failures",
            ),
            &["operation"],
        )
        .map_err(|e| telemetry_error("backend_errors_total", e))?;

        let fallback_operations_total = IntCounter::new(
            "mathilda_cache_fallback_operations_total",
            "Total number of operations served by the in-process store",
        )
        .map_err(|e| telemetry_error("fallback_operations_total", e))?;

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mathilda_query_duration_seconds",
                "Data-access call duration in seconds",
            )
            .buckets(QUERY_LATENCY_BUCKETS.to_vec()),
            &["entity", "action"],
        )
        .map_err(|e| telemetry_error("query_duration_seconds", e))?;

        let slow_queries_total = IntCounterVec::new(
            Opts::new(
                "mathilda_slow_queries_total",
                "Total number of calls over the slow-query threshold",
            ),
            &["entity"],
        )
        .map_err(|e| telemetry_error("slow_queries_total", e))?;

        registry
            .register(Box::new(requests_total.clone()))
            .map_err(|e| telemetry_error("requests_total", e))?;
        registry
            .register(Box::new(backend_errors_total.clone()))
            .map_err(|e| telemetry_error("backend_errors_total", e))?;
        registry
            .register(Box::new(fallback_operations_total.clone()))
            .map_err(|e| telemetry_error("fallback_operations_total", e))?;
        registry
            .register(Box::new(query_duration_seconds.clone()))
            .map_err(|e| telemetry_error("query_duration_seconds", e))?;
        registry
            .register(Box::new(slow_queries_total.clone()))
            .map_err(|e| telemetry_error("slow_queries_total", e))?;

        Ok(Self {
            registry,
            requests_total,
            backend_errors_total,
            fallback_operations_total,
            query_duration_seconds,
            slow_queries_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a cache lookup outcome.
    pub fn record_lookup(&self, category: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.requests_total.with_label_values(&[category, result]).inc();
    }

    pub fn record_backend_error(&self, operation: &str) {
        self.backend_errors_total.with_label_values(&[operation]).inc();
    }

    pub fn record_fallback(&self) {
        self.fallback_operations_total.inc();
    }

    pub fn record_query(&self, entity: &str, action: &str, seconds: f64) {
        self.query_duration_seconds
            .with_label_values(&[entity, action])
            .observe(seconds);
    }

    pub fn record_slow_query(&self, entity: &str) {
        self.slow_queries_total.with_label_values(&[entity]).inc();
    }

    /// Text exposition format for scraping.
    pub fn encode(&self) -> MathildaResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MathildaError::Telemetry {
                reason: format!("Failed to encode metrics: {}", e),
            })?;
        String::from_utf8(buffer).map_err(|e| MathildaError::Telemetry {
            reason: format!("Metrics are not valid UTF-8: {}", e),
        })
    }
}
