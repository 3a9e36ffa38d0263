//! End-to-end cache scenarios: cache-aside reads, outages of the distributed
//! store, invalidation and runtime-driven backend selection.

use std::sync::Arc;
use std::time::Duration;

use mathilda_cache::{
    build_cache_client, BackendKind, CacheService, CachingExecutor, Invalidator, KeyTtl,
    KeyValueBackend, LeaveEvent, LeaveRef, Query, QueryAction, QueryExecutor,
};
use mathilda_core::{CacheConfig, KeySpace, RuntimeCapabilities, TtlPolicy};
use mathilda_test_utils::assertions::{assert_cached, assert_not_cached};
use mathilda_test_utils::generators::{arb_args, arb_entity, arb_read_action};
use mathilda_test_utils::{fixtures, FailingBackend, RecordingExecutor, SwitchableBackend};
use proptest::prelude::*;
use serde_json::json;

fn caching(
    executor: RecordingExecutor,
    cache: Arc<mathilda_cache::CacheClient>,
) -> CachingExecutor<RecordingExecutor> {
    CachingExecutor::new(executor, cache, Arc::new(TtlPolicy::standard()))
}

fn date(s: &str) -> chrono::NaiveDate {
    s.parse().unwrap()
}

// ============================================================================
// CACHE-ASIDE READS
// ============================================================================

#[tokio::test]
async fn test_second_read_is_served_from_cache() {
    let clock = fixtures::manual_clock();
    let recorder = RecordingExecutor::new();
    let executor = caching(recorder.clone(), fixtures::in_memory_client(&clock, 100));
    let query = Query::new("Site", QueryAction::FindMany, fixtures::planning_args("s1"));

    let first = executor.execute(&query).await.unwrap();
    let second = executor.execute(&query).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(recorder.call_count(), 1);
}

#[tokio::test]
async fn test_reordered_arguments_share_a_cache_entry() {
    let clock = fixtures::manual_clock();
    let recorder = RecordingExecutor::new();
    let executor = caching(recorder.clone(), fixtures::in_memory_client(&clock, 100));

    let a = Query::new("Site", QueryAction::FindMany, json!({"where": {"a": 1, "b": 2}, "take": 5}));
    let b = Query::new("Site", QueryAction::FindMany, json!({"take": 5, "where": {"b": 2, "a": 1}}));
    executor.execute(&a).await.unwrap();
    executor.execute(&b).await.unwrap();

    assert_eq!(recorder.call_count(), 1);
}

#[tokio::test]
async fn test_settings_entry_expires_after_an_hour() {
    let clock = fixtures::manual_clock();
    let cache = fixtures::in_memory_client(&clock, 100);
    let recorder = RecordingExecutor::new();
    let executor = caching(recorder.clone(), Arc::clone(&cache));
    let query = Query::new("Settings", QueryAction::FindFirst, json!({}));

    executor.execute(&query).await.unwrap();
    let key = cache
        .key_space()
        .query("Settings", QueryAction::FindFirst.as_str(), &json!({}));
    match cache.ttl(key.as_str()).await {
        KeyTtl::Expires(remaining) => {
            assert!(remaining > Duration::ZERO);
            assert!(remaining <= Duration::from_secs(3600));
        }
        other => panic!("Expected an expiring entry, got {other:?}"),
    }

    clock.advance(chrono::Duration::seconds(3601));
    executor.execute(&query).await.unwrap();
    assert_eq!(recorder.call_count(), 2);
}

#[tokio::test]
async fn test_uncacheable_entity_always_hits_the_executor() {
    let clock = fixtures::manual_clock();
    let recorder = RecordingExecutor::new();
    let executor = caching(recorder.clone(), fixtures::in_memory_client(&clock, 100));
    let query = Query::new("AuditLog", QueryAction::FindMany, json!({}));

    executor.execute(&query).await.unwrap();
    executor.execute(&query).await.unwrap();

    assert_eq!(recorder.calls_for("AuditLog"), 2);
}

#[tokio::test]
async fn test_failed_reads_are_not_cached() {
    let clock = fixtures::manual_clock();
    let recorder = RecordingExecutor::new();
    recorder.fail_entity("Site");
    let executor = caching(recorder.clone(), fixtures::in_memory_client(&clock, 100));
    let query = Query::new("Site", QueryAction::FindMany, json!({}));

    assert!(executor.execute(&query).await.is_err());
    assert!(executor.execute(&query).await.is_err());
    assert_eq!(recorder.call_count(), 2);
}

#[tokio::test]
async fn test_write_drops_cached_reads_of_the_entity() {
    let clock = fixtures::manual_clock();
    let cache = fixtures::in_memory_client(&clock, 100);
    let recorder = RecordingExecutor::new();
    let executor = caching(recorder.clone(), Arc::clone(&cache));

    let read = Query::new("Site", QueryAction::FindMany, json!({}));
    let other = Query::new("Specialty", QueryAction::FindMany, json!({}));
    executor.execute(&read).await.unwrap();
    executor.execute(&other).await.unwrap();

    let write = Query::new("Site", QueryAction::Update, json!({"where": {"id": "s1"}}));
    executor.execute(&write).await.unwrap();

    executor.execute(&read).await.unwrap();
    executor.execute(&other).await.unwrap();
    assert_eq!(recorder.calls_for("Site"), 3);
    assert_eq!(recorder.calls_for("Specialty"), 1);
}

// ============================================================================
// FAIL-OPEN BEHAVIOUR
// ============================================================================

#[tokio::test]
async fn test_failing_backend_never_surfaces_errors() {
    let clock = fixtures::manual_clock();
    let backend = Arc::new(FailingBackend::new());
    let cache = fixtures::client_with_primary(backend.clone(), &clock);

    assert!(cache.set("mathilda:api:x", "1", Some(Duration::from_secs(60))).await);
    assert_eq!(cache.get("mathilda:api:x").await.as_deref(), Some("1"));
    assert!(cache.exists("mathilda:api:x").await);
    assert!(cache.del("mathilda:api:x").await);
    assert_eq!(cache.get("mathilda:api:x").await, None);
    assert!(cache.keys("mathilda:*").await.is_empty());

    let stats = cache.stats();
    assert_eq!(stats.backend, BackendKind::Distributed);
    assert!(stats.backend_errors >= 5);
    assert!(backend.call_count() >= 5);
}

#[tokio::test]
async fn test_reads_keep_working_through_a_backend_outage() {
    let clock = fixtures::manual_clock();
    let backend = Arc::new(SwitchableBackend::new());
    let cache = fixtures::client_with_primary(backend.clone(), &clock);
    let recorder = RecordingExecutor::new();
    let executor = caching(recorder.clone(), Arc::clone(&cache));
    let query = Query::new("Site", QueryAction::FindMany, json!({}));

    executor.execute(&query).await.unwrap();
    assert_eq!(backend.store().len(), 1);

    // Outage: the primary times out, the fallback takes over.
    backend.set_failing(true);
    let during = executor.execute(&query).await.unwrap();
    let again = executor.execute(&query).await.unwrap();
    assert_eq!(during, again);
    assert_eq!(recorder.call_count(), 2);
    assert!(cache.stats().fallback_operations >= 2);

    // Recovery: the primary's copy is served again.
    backend.set_failing(false);
    executor.execute(&query).await.unwrap();
    assert_eq!(recorder.call_count(), 2);
}

#[tokio::test]
async fn test_disconnected_primary_is_skipped() {
    let clock = fixtures::manual_clock();
    let backend = Arc::new(SwitchableBackend::new());
    backend.set_connected(false);
    let cache = fixtures::client_with_primary(backend.clone(), &clock);

    assert!(cache.set("mathilda:api:y", "2", None).await);
    assert!(backend.store().is_empty());
    assert_eq!(cache.get("mathilda:api:y").await.as_deref(), Some("2"));
    assert_eq!(cache.stats().backend_errors, 0);
}

#[tokio::test]
async fn test_invalidation_reaches_both_stores() {
    let clock = fixtures::manual_clock();
    let backend = Arc::new(SwitchableBackend::new());
    let cache = fixtures::client_with_primary(backend.clone(), &clock);
    let invalidator = Invalidator::new(Arc::clone(&cache));

    // Written to the fallback during an outage, then to the primary.
    backend.set_failing(true);
    cache.set("mathilda:search:users:1", "[]", None).await;
    backend.set_failing(false);
    cache.set("mathilda:search:users:2", "[]", None).await;

    assert_eq!(invalidator.invalidate_search_results().await, 2);
    assert!(cache.fallback_store().is_empty());
    assert!(backend.store().is_empty());
}

// ============================================================================
// INVALIDATION
// ============================================================================

#[tokio::test]
async fn test_planning_invalidation_keeps_unrelated_keys() {
    let clock = fixtures::manual_clock();
    let cache = fixtures::in_memory_client(&clock, 100);
    let invalidator = Invalidator::new(Arc::clone(&cache));
    cache.set("mathilda:planning:data:1", "1", None).await;
    cache.set("mathilda:planning:data:2", "2", None).await;
    cache.set("mathilda:user:profile:9", "9", None).await;

    invalidator.invalidate_planning_cache(None).await;

    assert_not_cached(&cache, "mathilda:planning:data:1").await;
    assert_not_cached(&cache, "mathilda:planning:data:2").await;
    assert_cached(&cache, "mathilda:user:profile:9").await;
}

#[tokio::test]
async fn test_invalidation_is_idempotent() {
    let clock = fixtures::manual_clock();
    let cache = fixtures::in_memory_client(&clock, 100);
    let invalidator = Invalidator::new(Arc::clone(&cache));
    let keys = cache.key_space().clone();
    cache.set(keys.user_profile("9").as_str(), "{}", None).await;

    assert_eq!(invalidator.invalidate_user_cache("9").await, 1);
    assert_eq!(invalidator.invalidate_user_cache("9").await, 0);
    assert_eq!(invalidator.invalidate_by_pattern("nothing:*").await, 0);
    assert_eq!(invalidator.invalidate_all().await, 0);
}

#[tokio::test]
async fn test_leave_created_drops_owner_lists_and_balances() {
    let clock = fixtures::manual_clock();
    let cache = fixtures::in_memory_client(&clock, 100);
    let invalidator = Invalidator::new(Arc::clone(&cache));
    let keys = cache.key_space().clone();

    let owned = keys.user_leaves("9", Some(2025));
    let balance = keys.leave_balance("9", 2025);
    let list = keys.leave_list(&json!({"status": "PENDING"}));
    let someone_else = keys.user_leaves("12", Some(2025));
    for key in [&owned, &balance, &list, &someone_else] {
        cache.set(key.as_str(), "[]", None).await;
    }

    let leave = LeaveRef::new("l1", "9", date("2025-03-03"), date("2025-03-07"));
    invalidator
        .invalidate_leave_event(&LeaveEvent::Created { leave })
        .await;

    assert_not_cached(&cache, owned.as_str()).await;
    assert_not_cached(&cache, balance.as_str()).await;
    assert_not_cached(&cache, list.as_str()).await;
    assert_cached(&cache, someone_else.as_str()).await;
}

#[tokio::test]
async fn test_namespaces_are_isolated() {
    let clock = fixtures::manual_clock();
    let cache = fixtures::in_memory_client(&clock, 100);
    cache.set("mathilda:api:a", "1", None).await;
    cache.set("other:api:a", "1", None).await;

    assert_eq!(Invalidator::new(Arc::clone(&cache)).invalidate_all().await, 1);
    assert_cached(&cache, "other:api:a").await;
}

// ============================================================================
// BACKEND SELECTION
// ============================================================================

#[test]
fn test_backend_follows_runtime_capabilities() {
    let clock: Arc<dyn mathilda_core::Clock> = Arc::new(fixtures::manual_clock());
    let enabled = CacheConfig::default();

    let edge = build_cache_client(&enabled, &RuntimeCapabilities::edge(), clock.clone()).unwrap();
    assert_eq!(edge.backend_kind(), BackendKind::InMemory);

    let harness =
        build_cache_client(&enabled, &RuntimeCapabilities::test_harness(), clock.clone()).unwrap();
    assert_eq!(harness.backend_kind(), BackendKind::InMemory);

    let server = build_cache_client(&enabled, &RuntimeCapabilities::server(), clock.clone()).unwrap();
    assert_eq!(server.backend_kind(), BackendKind::Distributed);

    let disabled =
        build_cache_client(&fixtures::test_config(), &RuntimeCapabilities::server(), clock).unwrap();
    assert_eq!(disabled.backend_kind(), BackendKind::InMemory);
}

#[tokio::test]
async fn test_service_on_edge_runtime_never_connects() {
    let service = CacheService::new(CacheConfig::default(), RuntimeCapabilities::edge()).unwrap();
    service.connect();
    assert!(service.wait_until_connected(Duration::from_millis(5)).await);
    assert_eq!(service.stats().backend, BackendKind::InMemory);

    let recorder = RecordingExecutor::new();
    let db = service.data_access(recorder.clone());
    let query = Query::new("Site", QueryAction::Count, json!({}));
    db.execute(&query).await.unwrap();
    db.execute(&query).await.unwrap();
    assert_eq!(recorder.call_count(), 1);
}

// ============================================================================
// KEY DERIVATION PROPERTIES
// ============================================================================

proptest! {
    #[test]
    fn prop_query_keys_are_deterministic(
        entity in arb_entity(),
        action in arb_read_action(),
        args in arb_args(),
    ) {
        let keys = KeySpace::default();
        let a = keys.query(&entity, action.as_str(), &args);
        let b = keys.query(&entity, action.as_str(), &args.clone());
        prop_assert_eq!(a.as_str(), b.as_str());
        prop_assert!(a.as_str().starts_with("mathilda:"));
    }

    #[test]
    fn prop_different_arguments_give_different_keys(
        entity in arb_entity(),
        action in arb_read_action(),
        a in arb_args(),
        b in arb_args(),
    ) {
        prop_assume!(a != b);
        let keys = KeySpace::default();
        prop_assert_ne!(
            keys.query(&entity, action.as_str(), &a),
            keys.query(&entity, action.as_str(), &b)
        );
    }

    #[test]
    fn prop_entity_pattern_covers_its_queries(
        entity in arb_entity(),
        action in arb_read_action(),
        args in arb_args(),
    ) {
        let keys = KeySpace::default();
        let key = keys.query(&entity, action.as_str(), &args);
        prop_assert!(mathilda_cache::wildcard_match(&keys.query_entity_pattern(&entity), key.as_str()));
    }
}

#[tokio::test]
async fn test_fallback_backend_trait_object_is_usable() {
    // The fallback store is itself a backend and can stand in as a primary.
    let clock = fixtures::manual_clock();
    let primary: Arc<dyn KeyValueBackend> =
        Arc::new(mathilda_cache::MemoryStore::with_clock(10, Arc::new(clock.clone())));
    let cache = fixtures::client_with_primary(Arc::clone(&primary), &clock);
    cache.set("mathilda:api:z", "3", None).await;
    assert_eq!(primary.get("mathilda:api:z").await.unwrap().as_deref(), Some("3"));
    assert!(cache.fallback_store().is_empty());
}
