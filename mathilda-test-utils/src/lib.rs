//! Mathilda Test Utilities
//!
//! Shared test infrastructure for the cache workspace:
//! - Fake executors and backends for exercising the cache paths
//! - Proptest generators for query arguments and date ranges
//! - Fixtures for common scenarios
//! - Assertions over cache contents

pub use mathilda_core::{
    CacheConfig, CacheError, CacheResult, Clock, KeySpace, ManualClock, RuntimeCapabilities,
    Timestamp, TtlPolicy,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mathilda_cache::{
    CacheClient, CacheMetrics, ConnectionState, KeyTtl, KeyValueBackend, MemoryStore, Query,
    QueryExecutor,
};
use serde_json::{json, Value};

// ============================================================================
// FAKE EXECUTORS
// ============================================================================

/// Executor that records every call and answers with a description of it.
///
/// Clones share the same call log, so a test can keep a handle after moving
/// the executor into a decorator.
#[derive(Debug, Clone, Default)]
pub struct RecordingExecutor {
    calls: Arc<Mutex<Vec<Query>>>,
    failing_entities: Arc<Mutex<Vec<String>>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call for `entity` fail.
    pub fn fail_entity(&self, entity: impl Into<String>) {
        if let Ok(mut failing) = self.failing_entities.lock() {
            failing.push(entity.into());
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Calls made for one entity.
    pub fn calls_for(&self, entity: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|q| q.entity == entity).count())
            .unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<Query> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl QueryExecutor for RecordingExecutor {
    type Error = String;

    async fn execute(&self, query: &Query) -> Result<Value, String> {
        let call = {
            let mut calls = self.calls.lock().map_err(|e| e.to_string())?;
            calls.push(query.clone());
            calls.len()
        };
        let failing = self
            .failing_entities
            .lock()
            .map(|f| f.contains(&query.entity))
            .unwrap_or(false);
        if failing {
            return Err(format!("{} query failed", query.entity));
        }
        Ok(json!({
            "entity": query.entity,
            "action": query.action.as_str(),
            "args": query.args,
            "call": call,
        }))
    }
}

// ============================================================================
// FAKE BACKENDS
// ============================================================================

/// Backend that claims to be connected and fails every command.
#[derive(Debug, Default)]
pub struct FailingBackend {
    calls: AtomicUsize,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self, operation: &str) -> CacheResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Command {
            operation: operation.to_string(),
            reason: "injected failure".to_string(),
        })
    }
}

#[async_trait]
impl KeyValueBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn get(&self, _key: &str) -> CacheResult<Option<String>> {
        self.fail("GET")
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> CacheResult<()> {
        self.fail("SET")
    }

    async fn delete(&self, _key: &str) -> CacheResult<bool> {
        self.fail("DEL")
    }

    async fn delete_many(&self, _keys: &[String]) -> CacheResult<u64> {
        self.fail("DEL")
    }

    async fn exists(&self, _key: &str) -> CacheResult<bool> {
        self.fail("EXISTS")
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> CacheResult<bool> {
        self.fail("EXPIRE")
    }

    async fn ttl(&self, _key: &str) -> CacheResult<KeyTtl> {
        self.fail("TTL")
    }

    async fn keys(&self, _pattern: &str) -> CacheResult<Vec<String>> {
        self.fail("KEYS")
    }

    async fn flush(&self) -> CacheResult<()> {
        self.fail("FLUSHDB")
    }

    async fn hget(&self, _key: &str, _field: &str) -> CacheResult<Option<String>> {
        self.fail("HGET")
    }

    async fn hset(&self, _key: &str, _field: &str, _value: &str) -> CacheResult<()> {
        self.fail("HSET")
    }

    async fn hgetall(&self, _key: &str) -> CacheResult<HashMap<String, String>> {
        self.fail("HGETALL")
    }

    async fn ping(&self) -> CacheResult<()> {
        self.fail("PING")
    }
}

/// A working in-process "remote" store that can be switched into a failing
/// or disconnected state mid-test.
#[derive(Debug)]
pub struct SwitchableBackend {
    store: MemoryStore,
    failing: AtomicBool,
    connected: AtomicBool,
}

impl Default for SwitchableBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SwitchableBackend {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(10_000),
            failing: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        }
    }

    /// Commands fail while set, but the backend still reports `Connected`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// The backing store, bypassing the failure switch.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn check(&self, operation: &str) -> CacheResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Timeout {
                operation: operation.to_string(),
                after: Duration::from_millis(500),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueBackend for SwitchableBackend {
    fn name(&self) -> &'static str {
        "switchable"
    }

    fn connection_state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check("GET")?;
        self.store.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.check("SET")?;
        self.store.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.check("DEL")?;
        self.store.delete(key).await
    }

    async fn delete_many(&self, keys: &[String]) -> CacheResult<u64> {
        self.check("DEL")?;
        self.store.delete_many(keys).await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.check("EXISTS")?;
        self.store.exists(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.check("EXPIRE")?;
        self.store.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl> {
        self.check("TTL")?;
        self.store.ttl(key).await
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.check("KEYS")?;
        self.store.keys(pattern).await
    }

    async fn flush(&self) -> CacheResult<()> {
        self.check("FLUSHDB")?;
        self.store.flush().await
    }

    async fn hget(&self, key: &str, field: &str) -> CacheResult<Option<String>> {
        self.check("HGET")?;
        self.store.hget(key, field).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        self.check("HSET")?;
        self.store.hset(key, field, value).await
    }

    async fn hgetall(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        self.check("HGETALL")?;
        self.store.hgetall(key).await
    }

    async fn ping(&self) -> CacheResult<()> {
        self.check("PING")
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for query arguments and planning ranges.

    use super::*;
    use chrono::NaiveDate;
    use mathilda_cache::QueryAction;
    use proptest::prelude::*;

    /// Entity names used by the application.
    pub fn arb_entity() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("User".to_string()),
            Just("Site".to_string()),
            Just("Planning".to_string()),
            Just("Leave".to_string()),
            Just("Settings".to_string()),
            "[A-Z][a-zA-Z]{2,12}",
        ]
    }

    /// Any cacheable read action.
    pub fn arb_read_action() -> impl Strategy<Value = QueryAction> {
        proptest::sample::select(QueryAction::READS.to_vec())
    }

    /// A JSON scalar.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 _-]{0,16}".prop_map(Value::String),
        ]
    }

    /// Nested JSON shaped like ORM arguments (`where`, `take`, `orderBy`...).
    pub fn arb_args() -> impl Strategy<Value = Value> {
        arb_scalar().prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-zA-Z]{1,10}", inner, 0..5)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    /// A date between 2020 and 2030.
    pub fn arb_date() -> impl Strategy<Value = NaiveDate> {
        (0i64..3650).prop_map(|days| {
            NaiveDate::from_ymd_opt(2020, 1, 1)
                .unwrap_or_default()
                .checked_add_signed(chrono::Duration::days(days))
                .unwrap_or_default()
        })
    }

    /// An inclusive range of at most two months.
    pub fn arb_date_range() -> impl Strategy<Value = (NaiveDate, NaiveDate)> {
        (arb_date(), 0i64..62).prop_map(|(start, len)| {
            let end = start
                .checked_add_signed(chrono::Duration::days(len))
                .unwrap_or(start);
            (start, end)
        })
    }

    /// A timestamp between 2020 and 2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(chrono::Utc::now)
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common testing scenarios.

    use super::*;

    /// A fixed starting instant so expiry tests read naturally.
    pub fn epoch() -> Timestamp {
        chrono::DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_else(chrono::Utc::now)
    }

    pub fn manual_clock() -> ManualClock {
        ManualClock::new(epoch())
    }

    /// Config for an in-memory setup with a small fallback store.
    pub fn test_config() -> CacheConfig {
        CacheConfig::default()
            .with_enabled(false)
            .with_fallback_capacity(100)
    }

    pub fn metrics() -> Arc<CacheMetrics> {
        Arc::new(CacheMetrics::new().unwrap_or_else(|e| panic!("metrics registration failed: {e}")))
    }

    /// In-memory client reading time from `clock`.
    pub fn in_memory_client(clock: &ManualClock, capacity: usize) -> Arc<CacheClient> {
        let store = MemoryStore::with_clock(capacity, Arc::new(clock.clone()));
        Arc::new(CacheClient::in_memory(Arc::new(store), metrics()))
    }

    /// Client whose primary is `primary` and whose fallback reads `clock`.
    pub fn client_with_primary(
        primary: Arc<dyn KeyValueBackend>,
        clock: &ManualClock,
    ) -> Arc<CacheClient> {
        let store = MemoryStore::with_clock(1000, Arc::new(clock.clone()));
        Arc::new(CacheClient::new(Some(primary), Arc::new(store), metrics()))
    }

    /// Typical `findMany` arguments for planning screens.
    pub fn planning_args(site_id: &str) -> Value {
        json!({
            "where": {"siteId": site_id, "date": {"gte": "2025-01-06", "lte": "2025-01-12"}},
            "orderBy": {"date": "asc"},
            "take": 50,
        })
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over cache contents.

    use super::*;

    /// Assert that `key` is present in the client.
    pub async fn assert_cached(client: &CacheClient, key: &str) {
        assert!(client.exists(key).await, "Expected {key} to be cached");
    }

    /// Assert that `key` is absent from the client.
    pub async fn assert_not_cached(client: &CacheClient, key: &str) {
        assert!(!client.exists(key).await, "Expected {key} not to be cached");
    }
}
