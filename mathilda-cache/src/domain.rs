//! Typed cache helpers for the application's hot paths.
//!
//! Each helper pairs a key from [`KeySpace`](mathilda_core::KeySpace) with
//! the TTL of its category. Values are stored as JSON snapshots; a value
//! that no longer decodes into the requested type reads as a miss.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use mathilda_core::{category, TtlPolicy};

use crate::client::CacheClient;
use crate::invalidation::{Invalidator, LeaveEvent};

#[derive(Debug, Clone)]
pub struct DomainCache {
    cache: Arc<CacheClient>,
    policy: Arc<TtlPolicy>,
    invalidator: Invalidator,
}

impl DomainCache {
    pub fn new(cache: Arc<CacheClient>, policy: Arc<TtlPolicy>) -> Self {
        let invalidator = Invalidator::new(Arc::clone(&cache));
        Self {
            cache,
            policy,
            invalidator,
        }
    }

    pub fn invalidator(&self) -> &Invalidator {
        &self.invalidator
    }

    fn ttl(&self, category: &str) -> Option<Duration> {
        self.policy.ttl_for(category)
    }

    async fn put<T: Serialize + ?Sized>(&self, category: &str, key: &str, value: &T) -> bool {
        match self.ttl(category) {
            Some(ttl) => self.cache.set_json(key, value, Some(ttl)).await,
            None => false,
        }
    }

    // === User profiles ===

    pub async fn cache_user_profile<T: Serialize + ?Sized>(&self, user_id: &str, profile: &T) -> bool {
        let key = self.cache.key_space().user_profile(user_id);
        self.put(category::USER, key.as_str(), profile).await
    }

    pub async fn get_user_profile<T: DeserializeOwned>(&self, user_id: &str) -> Option<T> {
        let key = self.cache.key_space().user_profile(user_id);
        self.cache.get_json(key.as_str()).await
    }

    pub async fn invalidate_user_cache(&self, user_id: &str) -> u64 {
        self.invalidator.invalidate_user_cache(user_id).await
    }

    // === Planning ===

    pub async fn cache_planning_data<T: Serialize + ?Sized>(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        filters: &Value,
        data: &T,
    ) -> bool {
        let key = self.cache.key_space().planning_data(start, end, filters);
        self.put(category::PLANNING, key.as_str(), data).await
    }

    pub async fn get_planning_data<T: DeserializeOwned>(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        filters: &Value,
    ) -> Option<T> {
        let key = self.cache.key_space().planning_data(start, end, filters);
        self.cache.get_json(key.as_str()).await
    }

    /// Planning of a single user over a date range.
    pub async fn cache_user_planning<T: Serialize + ?Sized>(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        data: &T,
    ) -> bool {
        let key = self.cache.key_space().planning_user(user_id, start, end);
        self.put(category::PLANNING, key.as_str(), data).await
    }

    pub async fn get_user_planning<T: DeserializeOwned>(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Option<T> {
        let key = self.cache.key_space().planning_user(user_id, start, end);
        self.cache.get_json(key.as_str()).await
    }

    pub async fn invalidate_planning_cache(&self, date: Option<NaiveDate>) -> u64 {
        self.invalidator.invalidate_planning_cache(date).await
    }

    // === Leaves ===
    //
    // Each leave data type has its own lifetime. Stale entries are removed
    // through `invalidate_leave_event`.

    pub async fn cache_leave_list<T: Serialize + ?Sized>(&self, filters: &Value, leaves: &T) -> bool {
        let key = self.cache.key_space().leave_list(filters);
        self.put(category::LEAVE_LIST, key.as_str(), leaves).await
    }

    pub async fn get_leave_list<T: DeserializeOwned>(&self, filters: &Value) -> Option<T> {
        let key = self.cache.key_space().leave_list(filters);
        self.cache.get_json(key.as_str()).await
    }

    pub async fn cache_leave_detail<T: Serialize + ?Sized>(&self, leave_id: &str, leave: &T) -> bool {
        let key = self.cache.key_space().leave_detail(leave_id);
        self.put(category::LEAVE_DETAIL, key.as_str(), leave).await
    }

    pub async fn get_leave_detail<T: DeserializeOwned>(&self, leave_id: &str) -> Option<T> {
        let key = self.cache.key_space().leave_detail(leave_id);
        self.cache.get_json(key.as_str()).await
    }

    pub async fn cache_leave_balance<T: Serialize + ?Sized>(&self, user_id: &str, year: i32, balance: &T) -> bool {
        let key = self.cache.key_space().leave_balance(user_id, year);
        self.put(category::LEAVE_BALANCE, key.as_str(), balance).await
    }

    pub async fn get_leave_balance<T: DeserializeOwned>(&self, user_id: &str, year: i32) -> Option<T> {
        let key = self.cache.key_space().leave_balance(user_id, year);
        self.cache.get_json(key.as_str()).await
    }

    /// Statistics under a scope label such as `global` or `balance`.
    pub async fn cache_leave_stats<T: Serialize + ?Sized>(&self, scope: &str, filters: &Value, stats: &T) -> bool {
        let key = self.cache.key_space().leave_stats(scope, filters);
        self.put(category::LEAVE_STATS, key.as_str(), stats).await
    }

    pub async fn get_leave_stats<T: DeserializeOwned>(&self, scope: &str, filters: &Value) -> Option<T> {
        let key = self.cache.key_space().leave_stats(scope, filters);
        self.cache.get_json(key.as_str()).await
    }

    pub async fn cache_user_leaves<T: Serialize + ?Sized>(
        &self,
        user_id: &str,
        year: Option<i32>,
        leaves: &T,
    ) -> bool {
        let key = self.cache.key_space().user_leaves(user_id, year);
        self.put(category::USER_LEAVES, key.as_str(), leaves).await
    }

    pub async fn get_user_leaves<T: DeserializeOwned>(&self, user_id: &str, year: Option<i32>) -> Option<T> {
        let key = self.cache.key_space().user_leaves(user_id, year);
        self.cache.get_json(key.as_str()).await
    }

    pub async fn cache_leave_conflicts<T: Serialize + ?Sized>(&self, params: &Value, conflicts: &T) -> bool {
        let key = self.cache.key_space().leave_conflicts(params);
        self.put(category::LEAVE_CONFLICTS, key.as_str(), conflicts).await
    }

    pub async fn get_leave_conflicts<T: DeserializeOwned>(&self, params: &Value) -> Option<T> {
        let key = self.cache.key_space().leave_conflicts(params);
        self.cache.get_json(key.as_str()).await
    }

    pub async fn invalidate_leave_event(&self, event: &LeaveEvent) -> u64 {
        self.invalidator.invalidate_leave_event(event).await
    }

    // === API responses ===

    pub async fn cache_api_response<T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        params: &Value,
        response: &T,
    ) -> bool {
        let key = self.cache.key_space().api_response(endpoint, params);
        self.put(category::API, key.as_str(), response).await
    }

    pub async fn get_api_response<T: DeserializeOwned>(&self, endpoint: &str, params: &Value) -> Option<T> {
        let key = self.cache.key_space().api_response(endpoint, params);
        self.cache.get_json(key.as_str()).await
    }

    // === Search ===

    pub async fn cache_search_results<T: Serialize + ?Sized>(
        &self,
        scope: &str,
        params: &Value,
        results: &T,
    ) -> bool {
        let key = self.cache.key_space().search_results(scope, params);
        self.put(category::SEARCH, key.as_str(), results).await
    }

    pub async fn get_search_results<T: DeserializeOwned>(&self, scope: &str, params: &Value) -> Option<T> {
        let key = self.cache.key_space().search_results(scope, params);
        self.cache.get_json(key.as_str()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::invalidation::LeaveRef;
    use crate::metrics::CacheMetrics;
    use mathilda_core::ManualClock;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        id: String,
        display_name: String,
    }

    fn domain(policy: TtlPolicy) -> (DomainCache, ManualClock) {
        let clock = ManualClock::default();
        let store = MemoryStore::with_clock(100, Arc::new(clock.clone()));
        let cache = Arc::new(CacheClient::in_memory(
            Arc::new(store),
            Arc::new(CacheMetrics::new().unwrap()),
        ));
        (DomainCache::new(cache, Arc::new(policy)), clock)
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_user_profile_round_trip_and_expiry() {
        let (domain, clock) = domain(TtlPolicy::standard());
        let profile = Profile {
            id: "9".to_string(),
            display_name: "Dr. Martin".to_string(),
        };
        assert!(domain.cache_user_profile("9", &profile).await);
        assert_eq!(domain.get_user_profile::<Profile>("9").await, Some(profile));

        // User profiles live ten minutes.
        clock.advance(chrono::Duration::minutes(10));
        assert_eq!(domain.get_user_profile::<Profile>("9").await, None);
    }

    #[tokio::test]
    async fn test_planning_data_is_keyed_by_range_and_filters() {
        let (domain, _) = domain(TtlPolicy::standard());
        let filters = json!({"siteId": "s1", "sectors": ["A", "B"]});
        let reordered = json!({"sectors": ["A", "B"], "siteId": "s1"});
        let data = json!([{"room": "1", "surgeon": "X"}]);

        assert!(
            domain
                .cache_planning_data(date("2025-01-06"), date("2025-01-12"), &filters, &data)
                .await
        );
        let hit: Option<Value> = domain
            .get_planning_data(date("2025-01-06"), date("2025-01-12"), &reordered)
            .await;
        assert_eq!(hit, Some(data));

        let miss: Option<Value> = domain
            .get_planning_data(date("2025-01-13"), date("2025-01-19"), &filters)
            .await;
        assert_eq!(miss, None);

        assert_eq!(domain.invalidate_planning_cache(Some(date("2025-01-08"))).await, 1);
        let gone: Option<Value> = domain
            .get_planning_data(date("2025-01-06"), date("2025-01-12"), &filters)
            .await;
        assert_eq!(gone, None);
    }

    #[tokio::test]
    async fn test_api_and_search_helpers() {
        let (domain, clock) = domain(TtlPolicy::standard());
        let params = json!({"page": 1});
        assert!(domain.cache_api_response("/api/sites", &params, &json!({"items": []})).await);
        assert!(domain.cache_search_results("users", &json!({"q": "mar"}), &json!(["Martin"])).await);

        let api: Option<Value> = domain.get_api_response("api/sites/", &params).await;
        assert_eq!(api, Some(json!({"items": []})));

        // API responses expire after a minute, search results after two.
        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(domain.get_api_response::<Value>("/api/sites", &params).await, None);
        assert_eq!(
            domain.get_search_results::<Vec<String>>("users", &json!({"q": "mar"})).await,
            Some(vec!["Martin".to_string()])
        );

        assert_eq!(domain.invalidator().invalidate_search_results().await, 1);
    }

    #[tokio::test]
    async fn test_disabled_category_is_not_cached() {
        let policy = TtlPolicy::builder().with_ttl(category::USER, 0).build();
        let (domain, _) = domain(policy);
        assert!(!domain.cache_user_profile("9", &json!({"id": "9"})).await);
        assert_eq!(domain.get_user_profile::<Value>("9").await, None);
    }

    #[tokio::test]
    async fn test_invalidate_user_drops_profile_and_user_planning() {
        let (domain, _) = domain(TtlPolicy::standard());
        domain.cache_user_profile("9", &json!({"id": "9"})).await;
        domain
            .cache_user_planning("9", date("2025-02-01"), date("2025-02-07"), &json!([]))
            .await;
        domain.cache_user_profile("10", &json!({"id": "10"})).await;

        assert_eq!(domain.invalidate_user_cache("9").await, 2);
        assert_eq!(
            domain
                .get_user_planning::<Value>("9", date("2025-02-01"), date("2025-02-07"))
                .await,
            None
        );
        assert!(domain.get_user_profile::<Value>("10").await.is_some());
    }

    fn march_leave(leave_id: &str, user_id: &str) -> LeaveRef {
        LeaveRef::new(leave_id, user_id, date("2025-03-03"), date("2025-03-07"))
    }

    /// Leave data for user 9 (leave L1) and user 10 (leave L2).
    async fn seed_leaves(domain: &DomainCache) {
        assert!(domain.cache_leave_list(&json!({"status": "PENDING"}), &json!(["L1"])).await);
        assert!(domain.cache_leave_detail("L1", &json!({"id": "L1"})).await);
        assert!(domain.cache_leave_detail("L2", &json!({"id": "L2"})).await);
        assert!(domain.cache_leave_balance("9", 2025, &json!({"remaining": 12})).await);
        assert!(domain.cache_leave_balance("10", 2025, &json!({"remaining": 20})).await);
        assert!(domain.cache_leave_stats("global", &json!({}), &json!({"total": 2})).await);
        assert!(domain.cache_leave_stats("balance", &json!({}), &json!({"used": 3})).await);
        assert!(domain.cache_user_leaves("9", Some(2025), &json!(["L1"])).await);
        assert!(domain.cache_user_leaves("9", None, &json!(["L1"])).await);
        assert!(domain.cache_user_leaves("10", None, &json!(["L2"])).await);
        assert!(domain.cache_leave_conflicts(&json!({"userId": "9"}), &json!([])).await);
    }

    async fn has_list(domain: &DomainCache) -> bool {
        domain
            .get_leave_list::<Value>(&json!({"status": "PENDING"}))
            .await
            .is_some()
    }

    async fn has_detail(domain: &DomainCache, leave_id: &str) -> bool {
        domain.get_leave_detail::<Value>(leave_id).await.is_some()
    }

    async fn has_balance(domain: &DomainCache, user_id: &str) -> bool {
        domain.get_leave_balance::<Value>(user_id, 2025).await.is_some()
    }

    async fn has_stats(domain: &DomainCache, scope: &str) -> bool {
        domain.get_leave_stats::<Value>(scope, &json!({})).await.is_some()
    }

    async fn has_user_leaves(domain: &DomainCache, user_id: &str, year: Option<i32>) -> bool {
        domain.get_user_leaves::<Value>(user_id, year).await.is_some()
    }

    async fn has_conflicts(domain: &DomainCache) -> bool {
        domain
            .get_leave_conflicts::<Value>(&json!({"userId": "9"}))
            .await
            .is_some()
    }

    #[tokio::test]
    async fn test_leave_helpers_round_trip_with_per_type_lifetimes() {
        let (domain, clock) = domain(TtlPolicy::standard());
        seed_leaves(&domain).await;
        assert_eq!(
            domain.get_leave_balance::<Value>("9", 2025).await,
            Some(json!({"remaining": 12}))
        );
        assert_eq!(
            domain.get_user_leaves::<Vec<String>>("9", Some(2025)).await,
            Some(vec!["L1".to_string()])
        );
        assert_eq!(domain.get_leave_balance::<Value>("9", 2024).await, None);

        // Conflicts: 10 minutes.
        clock.advance(chrono::Duration::minutes(10));
        assert!(!has_conflicts(&domain).await);
        assert!(has_user_leaves(&domain, "9", None).await);

        // User leaves: 30 minutes.
        clock.advance(chrono::Duration::minutes(20));
        assert!(!has_user_leaves(&domain, "9", None).await);
        assert!(has_list(&domain).await);

        // Lists: 1 hour.
        clock.advance(chrono::Duration::minutes(30));
        assert!(!has_list(&domain).await);
        assert!(has_balance(&domain, "9").await);

        // Balances: 2 hours.
        clock.advance(chrono::Duration::hours(1));
        assert!(!has_balance(&domain, "9").await);
        assert!(has_stats(&domain, "global").await);

        // Statistics: 12 hours.
        clock.advance(chrono::Duration::hours(10));
        assert!(!has_stats(&domain, "global").await);
        assert!(has_detail(&domain, "L1").await);

        // Details: 24 hours.
        clock.advance(chrono::Duration::hours(12));
        assert!(!has_detail(&domain, "L1").await);
    }

    #[tokio::test]
    async fn test_leave_created_invalidates_owner_lists_balances_and_stats() {
        let (domain, _) = domain(TtlPolicy::standard());
        seed_leaves(&domain).await;

        let event = LeaveEvent::Created {
            leave: march_leave("L1", "9"),
        };
        assert!(domain.invalidate_leave_event(&event).await > 0);

        assert!(!has_list(&domain).await);
        assert!(!has_balance(&domain, "9").await);
        assert!(!has_stats(&domain, "global").await);
        assert!(!has_stats(&domain, "balance").await);
        assert!(!has_user_leaves(&domain, "9", Some(2025)).await);
        assert!(!has_user_leaves(&domain, "9", None).await);
        assert!(!has_conflicts(&domain).await);

        assert!(has_detail(&domain, "L1").await);
        assert!(has_balance(&domain, "10").await);
        assert!(has_user_leaves(&domain, "10", None).await);
    }

    #[tokio::test]
    async fn test_leave_updated_invalidates_both_owners() {
        let (domain, _) = domain(TtlPolicy::standard());
        seed_leaves(&domain).await;

        let event = LeaveEvent::Updated {
            before: march_leave("L1", "9"),
            after: march_leave("L1", "10"),
        };
        assert!(domain.invalidate_leave_event(&event).await > 0);

        assert!(!has_detail(&domain, "L1").await);
        assert!(!has_balance(&domain, "9").await);
        assert!(!has_balance(&domain, "10").await);
        assert!(!has_user_leaves(&domain, "9", None).await);
        assert!(!has_user_leaves(&domain, "10", None).await);
        assert!(!has_list(&domain).await);
        assert!(!has_stats(&domain, "global").await);
        assert!(!has_conflicts(&domain).await);

        assert!(has_detail(&domain, "L2").await);
    }

    #[tokio::test]
    async fn test_leave_deleted_invalidates_detail_and_owner_data() {
        let (domain, _) = domain(TtlPolicy::standard());
        seed_leaves(&domain).await;

        let event = LeaveEvent::Deleted {
            leave: march_leave("L1", "9"),
        };
        assert!(domain.invalidate_leave_event(&event).await > 0);

        assert!(!has_detail(&domain, "L1").await);
        assert!(!has_balance(&domain, "9").await);
        assert!(!has_user_leaves(&domain, "9", Some(2025)).await);
        assert!(!has_list(&domain).await);
        assert!(!has_stats(&domain, "global").await);
        assert!(!has_conflicts(&domain).await);

        assert!(has_detail(&domain, "L2").await);
        assert!(has_balance(&domain, "10").await);
        assert!(has_user_leaves(&domain, "10", None).await);
    }

    #[tokio::test]
    async fn test_leave_status_change_invalidates_detail_lists_and_stats() {
        let (domain, _) = domain(TtlPolicy::standard());
        seed_leaves(&domain).await;

        let event = LeaveEvent::StatusChanged {
            leave: march_leave("L1", "9"),
        };
        assert!(domain.invalidate_leave_event(&event).await > 0);

        assert!(!has_detail(&domain, "L1").await);
        assert!(!has_list(&domain).await);
        assert!(!has_stats(&domain, "global").await);
        assert!(!has_stats(&domain, "balance").await);
        assert!(!has_user_leaves(&domain, "9", None).await);
        assert!(!has_balance(&domain, "9").await);

        assert!(has_detail(&domain, "L2").await);
        assert!(has_balance(&domain, "10").await);
    }

    #[tokio::test]
    async fn test_balance_update_invalidates_one_balance_and_balance_stats() {
        let (domain, _) = domain(TtlPolicy::standard());
        seed_leaves(&domain).await;

        let event = LeaveEvent::BalanceUpdated {
            user_id: "9".to_string(),
            year: 2025,
        };
        assert_eq!(domain.invalidate_leave_event(&event).await, 2);

        assert!(!has_balance(&domain, "9").await);
        assert!(!has_stats(&domain, "balance").await);

        assert!(has_balance(&domain, "10").await);
        assert!(has_stats(&domain, "global").await);
        assert!(has_list(&domain).await);
        assert!(has_detail(&domain, "L1").await);
        assert!(has_user_leaves(&domain, "9", None).await);
        assert!(has_conflicts(&domain).await);
    }

    #[tokio::test]
    async fn test_disabled_leave_type_is_not_cached() {
        let policy = TtlPolicy::builder().with_ttl(category::LEAVE_STATS, 0).build();
        let (domain, _) = domain(policy);
        assert!(!domain.cache_leave_stats("global", &json!({}), &json!({"total": 1})).await);
        assert!(!has_stats(&domain, "global").await);
        assert!(domain.cache_leave_detail("L1", &json!({"id": "L1"})).await);
    }
}
