//! Never-failing cache facade.
//!
//! [`CacheClient`] sends every call to the distributed backend while that
//! backend reports [`ConnectionState::Connected`]. Any backend error is
//! logged, counted, and the same call is replayed against the in-process
//! [`MemoryStore`]. Callers only ever see plain values: a miss, `false`, or
//! an empty list.
//!
//! Deletions (`del`, `del_many`, `delete_pattern`, `flush`) are applied to
//! both stores so data invalidated while the distributed store was healthy
//! cannot resurface from the fallback later, and vice versa.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use mathilda_core::{CacheConfig, CacheError, Clock, KeySpace, MathildaResult, RuntimeCapabilities};

use crate::backend::{
    BackendKind, ConnectionState, KeyTtl, KeyValueBackend, MemoryStore, RedisBackend,
};
use crate::metrics::CacheMetrics;

/// Snapshot of cache usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub backend: BackendKind,
    pub connection_state: ConnectionState,
    /// Live entries in the in-process store.
    pub fallback_entries: u64,
    pub fallback_capacity: u64,
    /// Entries removed from the in-process store to make room.
    pub evictions: u64,
    pub hits: u64,
    pub misses: u64,
    /// Calls served by the in-process store.
    pub fallback_operations: u64,
    /// Failed calls to the distributed store.
    pub backend_errors: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fallback_operations: AtomicU64,
    backend_errors: AtomicU64,
}

/// Runs `$call` on the primary when it is connected, replaying it on the
/// fallback store when the primary is absent or fails. `$b` is bound to
/// whichever store runs the call. Yields `None` only if both stores fail.
macro_rules! routed {
    ($client:expr, $op:literal, $key:expr, |$b:ident| $call:expr) => {{
        let mut served = None;
        if let Some($b) = $client.active_primary() {
            match $call.await {
                Ok(value) => served = Some(value),
                Err(e) => $client.note_backend_error($op, $key, &e),
            }
        }
        match served {
            Some(value) => Some(value),
            None => {
                $client.note_fallback();
                let $b = $client.fallback.as_ref();
                match $call.await {
                    Ok(value) => Some(value),
                    Err(e) => {
                        tracing::warn!(operation = $op, key = %$key, error = %e, "Fallback cache operation failed");
                        None
                    }
                }
            }
        }
    }};
}

/// Cache facade over an optional distributed backend and an in-process store.
pub struct CacheClient {
    primary: Option<Arc<dyn KeyValueBackend>>,
    fallback: Arc<MemoryStore>,
    keys: KeySpace,
    metrics: Arc<CacheMetrics>,
    counters: Counters,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("backend", &self.backend_kind())
            .field("primary", &self.primary.as_ref().map(|p| p.name()))
            .field("namespace", &self.keys.namespace())
            .finish_non_exhaustive()
    }
}

impl CacheClient {
    pub fn new(
        primary: Option<Arc<dyn KeyValueBackend>>,
        fallback: Arc<MemoryStore>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            primary,
            fallback,
            keys: KeySpace::default(),
            metrics,
            counters: Counters::default(),
        }
    }

    /// A client with no distributed backend.
    pub fn in_memory(fallback: Arc<MemoryStore>, metrics: Arc<CacheMetrics>) -> Self {
        Self::new(None, fallback, metrics)
    }

    /// Use a different key namespace.
    pub fn with_key_space(mut self, keys: KeySpace) -> Self {
        self.keys = keys;
        self
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn fallback_store(&self) -> &Arc<MemoryStore> {
        &self.fallback
    }

    pub fn backend_kind(&self) -> BackendKind {
        match self.primary {
            Some(_) => BackendKind::Distributed,
            None => BackendKind::InMemory,
        }
    }

    /// State of the distributed backend; always connected when in-memory only.
    pub fn connection_state(&self) -> ConnectionState {
        self.primary
            .as_ref()
            .map(|p| p.connection_state())
            .unwrap_or(ConnectionState::Connected)
    }

    /// Start connecting the distributed backend, if any. Returns immediately.
    pub fn connect(&self) {
        if let Some(primary) = &self.primary {
            primary.connect();
        }
    }

    pub async fn disconnect(&self) {
        if let Some(primary) = &self.primary {
            primary.disconnect().await;
        }
    }

    fn active_primary(&self) -> Option<&Arc<dyn KeyValueBackend>> {
        self.primary
            .as_ref()
            .filter(|p| p.connection_state() == ConnectionState::Connected)
    }

    fn note_backend_error(&self, operation: &'static str, key: &str, error: &CacheError) {
        self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_backend_error(operation);
        tracing::warn!(operation, key = %key, error = %error, "Cache backend error, using fallback");
    }

    fn note_fallback(&self) {
        self.counters.fallback_operations.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_fallback();
    }

    fn note_lookup(&self, key: &str, hit: bool) {
        let counter = if hit {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let category = key.split(':').nth(1).unwrap_or("unknown");
        self.metrics.record_lookup(category, hit);
    }

    /// Get a raw value. Errors read as a miss.
    pub async fn get(&self, key: &str) -> Option<String> {
        let value = routed!(self, "get", key, |b| b.get(key)).flatten();
        self.note_lookup(key, value.is_some());
        value
    }

    /// Store a raw value. Returns whether some store accepted it.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        routed!(self, "set", key, |b| b.set(key, value, ttl)).is_some()
    }

    /// Delete a key from both stores.
    pub async fn del(&self, key: &str) -> bool {
        let mut removed = false;
        if let Some(primary) = self.active_primary() {
            match primary.delete(key).await {
                Ok(r) => removed |= r,
                Err(e) => self.note_backend_error("del", key, &e),
            }
        }
        match self.fallback.delete(key).await {
            Ok(r) => removed |= r,
            Err(e) => tracing::warn!(key = %key, error = %e, "Fallback cache delete failed"),
        }
        removed
    }

    /// Delete several keys from both stores. Returns how many distinct keys existed.
    pub async fn del_many(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        let mut removed = 0;
        if let Some(primary) = self.active_primary() {
            match primary.delete_many(keys).await {
                Ok(n) => removed = n,
                Err(e) => self.note_backend_error("del", &keys.join(","), &e),
            }
        }
        match self.fallback.delete_many(keys).await {
            Ok(n) => removed.max(n),
            Err(e) => {
                tracing::warn!(count = keys.len(), error = %e, "Fallback cache delete failed");
                removed
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        routed!(self, "exists", key, |b| b.exists(key)).unwrap_or(false)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> bool {
        routed!(self, "expire", key, |b| b.expire(key, ttl)).unwrap_or(false)
    }

    pub async fn ttl(&self, key: &str) -> KeyTtl {
        routed!(self, "ttl", key, |b| b.ttl(key)).unwrap_or(KeyTtl::Missing)
    }

    /// Keys matching a `*` pattern in whichever store serves the call.
    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        routed!(self, "keys", pattern, |b| b.keys(pattern)).unwrap_or_default()
    }

    /// Remove every key from both stores.
    pub async fn flush(&self) -> bool {
        let mut flushed = true;
        if let Some(primary) = self.active_primary() {
            if let Err(e) = primary.flush().await {
                self.note_backend_error("flush", "*", &e);
                flushed = false;
            }
        }
        if let Err(e) = self.fallback.flush().await {
            tracing::warn!(error = %e, "Fallback cache flush failed");
            flushed = false;
        }
        flushed
    }

    pub async fn hget(&self, key: &str, field: &str) -> Option<String> {
        routed!(self, "hget", key, |b| b.hget(key, field)).flatten()
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> bool {
        routed!(self, "hset", key, |b| b.hset(key, field, value)).is_some()
    }

    pub async fn hgetall(&self, key: &str) -> HashMap<String, String> {
        routed!(self, "hgetall", key, |b| b.hgetall(key)).unwrap_or_default()
    }

    /// Delete every key matching `pattern` from both stores.
    ///
    /// Returns the number of distinct keys removed. Zero matches is a no-op.
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        let mut matched: BTreeSet<String> = BTreeSet::new();

        if let Some(primary) = self.active_primary() {
            match primary.keys(pattern).await {
                Ok(keys) if !keys.is_empty() => match primary.delete_many(&keys).await {
                    Ok(_) => matched.extend(keys),
                    Err(e) => self.note_backend_error("delete_pattern", pattern, &e),
                },
                Ok(_) => {}
                Err(e) => self.note_backend_error("delete_pattern", pattern, &e),
            }
        }

        match self.fallback.keys(pattern).await {
            Ok(keys) if !keys.is_empty() => match self.fallback.delete_many(&keys).await {
                Ok(_) => matched.extend(keys),
                Err(e) => tracing::warn!(pattern, error = %e, "Fallback cache delete failed"),
            },
            Ok(_) => {}
            Err(e) => tracing::warn!(pattern, error = %e, "Fallback cache scan failed"),
        }

        if !matched.is_empty() {
            tracing::debug!(pattern, removed = matched.len(), "Deleted keys by pattern");
        }
        matched.len() as u64
    }

    /// Get and deserialize a JSON value. Undecodable values read as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cached value could not be decoded");
                None
            }
        }
    }

    /// Serialize and store a JSON value.
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw, ttl).await,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Value could not be encoded for caching");
                false
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            backend: self.backend_kind(),
            connection_state: self.connection_state(),
            fallback_entries: self.fallback.len() as u64,
            fallback_capacity: self.fallback.capacity() as u64,
            evictions: self.fallback.evictions(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            fallback_operations: self.counters.fallback_operations.load(Ordering::Relaxed),
            backend_errors: self.counters.backend_errors.load(Ordering::Relaxed),
        }
    }
}

/// Build the cache client the runtime allows.
///
/// The distributed backend is created only when the config enables it and
/// the runtime can open sockets to it; otherwise the client is in-memory
/// only. The choice is made once here. The distributed backend is created
/// disconnected; call [`CacheClient::connect`] to start it.
pub fn build_cache_client(
    config: &CacheConfig,
    caps: &RuntimeCapabilities,
    clock: Arc<dyn Clock>,
) -> MathildaResult<CacheClient> {
    config.validate()?;
    let metrics = Arc::new(CacheMetrics::new()?);
    let fallback = Arc::new(MemoryStore::with_clock(config.fallback_capacity, clock));

    let kind = if config.enabled && caps.can_use_distributed_cache {
        BackendKind::Distributed
    } else {
        BackendKind::InMemory
    };

    let primary: Option<Arc<dyn KeyValueBackend>> = match kind {
        BackendKind::Distributed => {
            let backend: Arc<dyn KeyValueBackend> = RedisBackend::new(config.redis.clone());
            Some(backend)
        }
        BackendKind::InMemory => None,
    };

    tracing::info!(
        backend = ?kind,
        namespace = %config.key_prefix,
        fallback_capacity = config.fallback_capacity,
        "Cache client configured"
    );

    Ok(CacheClient::new(primary, fallback, metrics).with_key_space(KeySpace::new(&config.key_prefix)))
}
