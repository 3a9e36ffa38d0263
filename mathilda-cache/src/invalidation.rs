//! Explicit invalidation after writes.
//!
//! Every operation here is idempotent: running it twice leaves the cache in
//! the same state, and matching nothing is a no-op. Invalidation is not
//! transactional with the write that triggered it.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use mathilda_core::{KeySpace, PLANNING_ENTITIES};

use crate::client::CacheClient;

/// The parts of a leave that decide which cached data it appears in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRef {
    pub leave_id: String,
    pub user_id: String,
    /// Years touched by the leave's start and end dates.
    pub years: Vec<i32>,
}

impl LeaveRef {
    pub fn new(leave_id: impl Into<String>, user_id: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        use chrono::Datelike;
        let mut years = vec![start.year()];
        if end.year() != start.year() {
            years.push(end.year());
        }
        Self {
            leave_id: leave_id.into(),
            user_id: user_id.into(),
            years,
        }
    }
}

/// Changes to leaves that require cache invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeaveEvent {
    Created { leave: LeaveRef },
    Updated { before: LeaveRef, after: LeaveRef },
    Deleted { leave: LeaveRef },
    StatusChanged { leave: LeaveRef },
    BalanceUpdated { user_id: String, year: i32 },
}

/// Removes cached data that a write may have made stale.
#[derive(Debug, Clone)]
pub struct Invalidator {
    cache: Arc<CacheClient>,
}

impl Invalidator {
    pub fn new(cache: Arc<CacheClient>) -> Self {
        Self { cache }
    }

    fn keys(&self) -> &KeySpace {
        self.cache.key_space()
    }

    async fn delete_patterns(&self, patterns: &[String]) -> u64 {
        let mut removed = 0;
        for pattern in patterns {
            removed += self.cache.delete_pattern(pattern).await;
        }
        removed
    }

    /// Drop everything cached about one user.
    pub async fn invalidate_user_cache(&self, user_id: &str) -> u64 {
        let keys = self.keys();
        let mut removed = u64::from(self.cache.del(keys.user_profile(user_id).as_str()).await);
        removed += self
            .delete_patterns(&[
                keys.auth_user_pattern(user_id),
                keys.user_leaves_pattern(user_id),
                keys.leave_balance_pattern(user_id),
                keys.planning_user_pattern(user_id),
                keys.query_entity_pattern("User"),
            ])
            .await;
        tracing::debug!(user_id, removed, "Invalidated user cache");
        removed
    }

    /// Drop planning data.
    ///
    /// Without a date every planning key goes. With a date only planning
    /// keys whose inclusive range contains it are removed; keys whose range
    /// cannot be read are removed as well. Cached reads of planning
    /// entities are dropped in both cases.
    pub async fn invalidate_planning_cache(&self, date: Option<NaiveDate>) -> u64 {
        let keys = self.keys();
        let mut removed = match date {
            None => self.cache.delete_pattern(&keys.planning_pattern()).await,
            Some(date) => {
                let stale: Vec<String> = self
                    .cache
                    .keys(&keys.planning_pattern())
                    .await
                    .into_iter()
                    .filter(|key| match keys.planning_range(key) {
                        Some((start, end)) => start <= date && date <= end,
                        None => true,
                    })
                    .collect();
                self.cache.del_many(&stale).await
            }
        };

        let query_patterns: Vec<String> = PLANNING_ENTITIES
            .iter()
            .map(|entity| keys.query_entity_pattern(entity))
            .collect();
        removed += self.delete_patterns(&query_patterns).await;

        tracing::debug!(date = ?date, removed, "Invalidated planning cache");
        removed
    }

    /// Drop keys matching a `*` pattern.
    ///
    /// Patterns not already under the namespace are taken relative to it.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> u64 {
        let namespace = self.keys().namespace();
        let full = if pattern
            .strip_prefix(namespace)
            .is_some_and(|rest| rest.starts_with(':'))
        {
            pattern.to_string()
        } else {
            format!("{}:{}", namespace, pattern.trim_start_matches(':'))
        };
        let removed = self.cache.delete_pattern(&full).await;
        tracing::debug!(pattern = %full, removed, "Invalidated by pattern");
        removed
    }

    /// Drop every cached read of one entity.
    pub async fn invalidate_entity_queries(&self, entity: &str) -> u64 {
        let removed = self
            .cache
            .delete_pattern(&self.keys().query_entity_pattern(entity))
            .await;
        tracing::debug!(entity, removed, "Invalidated entity queries");
        removed
    }

    pub async fn invalidate_search_results(&self) -> u64 {
        self.cache.delete_pattern(&self.keys().search_pattern()).await
    }

    /// Drop everything under the namespace. Other namespaces are untouched.
    pub async fn invalidate_all(&self) -> u64 {
        let removed = self
            .cache
            .delete_pattern(&self.keys().namespace_pattern())
            .await;
        tracing::info!(removed, "Invalidated entire cache namespace");
        removed
    }

    /// Drop the leave data affected by `event`.
    pub async fn invalidate_leave_event(&self, event: &LeaveEvent) -> u64 {
        let keys = self.keys();
        let mut exact: BTreeSet<String> = BTreeSet::new();
        let mut patterns: BTreeSet<String> = BTreeSet::new();

        match event {
            LeaveEvent::Created { leave } => {
                add_user_leaves(keys, leave, &leave.years, &mut exact, &mut patterns);
                patterns.insert(keys.leave_list_pattern());
                patterns.insert(keys.leave_stats_pattern(None));
                patterns.insert(keys.leave_conflicts_pattern());
            }
            LeaveEvent::Updated { before, after } => {
                exact.insert(keys.leave_detail(&after.leave_id).into_string());
                // Dates may have moved across years, so every touched year
                // is cleared for both owners.
                let years: Vec<i32> = before.years.iter().chain(&after.years).copied().collect();
                add_user_leaves(keys, before, &years, &mut exact, &mut patterns);
                add_user_leaves(keys, after, &years, &mut exact, &mut patterns);
                patterns.insert(keys.leave_list_pattern());
                patterns.insert(keys.leave_stats_pattern(None));
                patterns.insert(keys.leave_conflicts_pattern());
            }
            LeaveEvent::Deleted { leave } | LeaveEvent::StatusChanged { leave } => {
                exact.insert(keys.leave_detail(&leave.leave_id).into_string());
                add_user_leaves(keys, leave, &leave.years, &mut exact, &mut patterns);
                // List keys are argument digests, so status-filtered lists
                // cannot be told apart from the others.
                patterns.insert(keys.leave_list_pattern());
                patterns.insert(keys.leave_stats_pattern(None));
                patterns.insert(keys.leave_conflicts_pattern());
            }
            LeaveEvent::BalanceUpdated { user_id, year } => {
                exact.insert(keys.leave_balance(user_id, *year).into_string());
                patterns.insert(keys.leave_stats_pattern(Some("balance")));
            }
        }

        let exact: Vec<String> = exact.into_iter().collect();
        let patterns: Vec<String> = patterns.into_iter().collect();
        let mut removed = self.cache.del_many(&exact).await;
        removed += self.delete_patterns(&patterns).await;
        removed += match event {
            LeaveEvent::BalanceUpdated { .. } => self.invalidate_entity_queries("LeaveBalance").await,
            _ => self.invalidate_entity_queries("Leave").await,
        };

        tracing::debug!(event = ?event, removed, "Invalidated leave cache");
        removed
    }
}

/// Per-user leave keys: the user's leave lists and their balances for `years`.
fn add_user_leaves(
    keys: &KeySpace,
    leave: &LeaveRef,
    years: &[i32],
    exact: &mut BTreeSet<String>,
    patterns: &mut BTreeSet<String>,
) {
    patterns.insert(keys.user_leaves_pattern(&leave.user_id));
    for year in years {
        exact.insert(keys.leave_balance(&leave.user_id, *year).into_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::metrics::CacheMetrics;
    use serde_json::json;

    fn invalidator() -> (Invalidator, Arc<CacheClient>) {
        let cache = Arc::new(CacheClient::in_memory(
            Arc::new(MemoryStore::new(1000)),
            Arc::new(CacheMetrics::new().unwrap()),
        ));
        (Invalidator::new(cache.clone()), cache)
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_planning_invalidation_removes_only_planning_keys() {
        let (invalidator, cache) = invalidator();
        cache.set("mathilda:planning:data:1", "1", None).await;
        cache.set("mathilda:planning:data:2", "2", None).await;
        cache.set("mathilda:user:profile:9", "9", None).await;

        assert_eq!(invalidator.invalidate_planning_cache(None).await, 2);
        assert!(!cache.exists("mathilda:planning:data:1").await);
        assert!(!cache.exists("mathilda:planning:data:2").await);
        assert!(cache.exists("mathilda:user:profile:9").await);

        assert_eq!(invalidator.invalidate_planning_cache(None).await, 0);
    }

    #[tokio::test]
    async fn test_planning_invalidation_by_date_keeps_other_ranges() {
        let (invalidator, cache) = invalidator();
        let keys = cache.key_space().clone();
        let january = keys.planning_data(date("2025-01-01"), date("2025-01-31"), &json!({}));
        let february = keys.planning_data(date("2025-02-01"), date("2025-02-28"), &json!({}));
        let user_jan = keys.planning_user("7", date("2025-01-10"), date("2025-01-20"));
        for key in [&january, &february, &user_jan] {
            cache.set(key.as_str(), "[]", None).await;
        }
        cache.set("mathilda:planning:legacy", "[]", None).await;

        let removed = invalidator
            .invalidate_planning_cache(Some(date("2025-01-15")))
            .await;
        assert_eq!(removed, 3);
        assert!(!cache.exists(january.as_str()).await);
        assert!(!cache.exists(user_jan.as_str()).await);
        assert!(!cache.exists("mathilda:planning:legacy").await);
        assert!(cache.exists(february.as_str()).await);
    }

    #[tokio::test]
    async fn test_user_invalidation_is_idempotent() {
        let (invalidator, cache) = invalidator();
        let keys = cache.key_space().clone();
        cache.set(keys.user_profile("9").as_str(), "{}", None).await;
        cache.set(keys.auth_user("9").as_str(), "{}", None).await;
        cache.set(keys.user_leaves("9", Some(2025)).as_str(), "[]", None).await;
        cache.set(keys.leave_balance("9", 2025).as_str(), "{}", None).await;
        cache.set(keys.user_profile("10").as_str(), "{}", None).await;

        assert_eq!(invalidator.invalidate_user_cache("9").await, 4);
        assert_eq!(invalidator.invalidate_user_cache("9").await, 0);
        assert!(cache.exists(keys.user_profile("10").as_str()).await);
    }

    #[tokio::test]
    async fn test_pattern_is_relative_to_namespace() {
        let (invalidator, cache) = invalidator();
        cache.set("mathilda:api:sites:abc", "{}", None).await;
        cache.set("mathilda:api:users:abc", "{}", None).await;
        cache.set("other:api:sites:abc", "{}", None).await;

        assert_eq!(invalidator.invalidate_by_pattern("api:sites:*").await, 1);
        assert_eq!(invalidator.invalidate_by_pattern("mathilda:api:*").await, 1);
        assert!(cache.exists("other:api:sites:abc").await);
        assert_eq!(invalidator.invalidate_all().await, 0);
    }

    #[tokio::test]
    async fn test_leave_created_clears_lists_stats_and_balance() {
        let (invalidator, cache) = invalidator();
        let keys = cache.key_space().clone();
        let leave = LeaveRef::new("L1", "9", date("2025-12-29"), date("2026-01-02"));
        assert_eq!(leave.years, vec![2025, 2026]);

        let list = keys.leave_list(&json!({"status": "PENDING"}));
        let stats = keys.leave_stats("global", &json!({}));
        let detail = keys.leave_detail("L1");
        let balance = keys.leave_balance("9", 2026);
        let other_user = keys.user_leaves("10", None);
        for key in [&list, &stats, &detail, &balance, &other_user] {
            cache.set(key.as_str(), "{}", None).await;
        }

        invalidator
            .invalidate_leave_event(&LeaveEvent::Created { leave })
            .await;
        assert!(!cache.exists(list.as_str()).await);
        assert!(!cache.exists(stats.as_str()).await);
        assert!(!cache.exists(balance.as_str()).await);
        // A new leave has no cached detail yet; existing details are kept.
        assert!(cache.exists(detail.as_str()).await);
        assert!(cache.exists(other_user.as_str()).await);
    }

    #[tokio::test]
    async fn test_leave_update_covers_both_users() {
        let (invalidator, cache) = invalidator();
        let keys = cache.key_space().clone();
        let before = LeaveRef::new("L1", "9", date("2025-03-01"), date("2025-03-05"));
        let after = LeaveRef::new("L1", "10", date("2025-03-02"), date("2025-03-06"));
        let stale = [
            keys.leave_detail("L1"),
            keys.user_leaves("9", None),
            keys.user_leaves("10", Some(2025)),
            keys.leave_balance("9", 2025),
            keys.leave_balance("10", 2025),
        ];
        for key in &stale {
            cache.set(key.as_str(), "{}", None).await;
        }

        invalidator
            .invalidate_leave_event(&LeaveEvent::Updated { before, after })
            .await;
        for key in &stale {
            assert!(!cache.exists(key.as_str()).await, "{key} should be gone");
        }
    }

    #[tokio::test]
    async fn test_balance_update_is_narrow() {
        let (invalidator, cache) = invalidator();
        let keys = cache.key_space().clone();
        let balance = keys.leave_balance("9", 2025);
        let balance_stats = keys.leave_stats("balance", &json!({}));
        let global_stats = keys.leave_stats("global", &json!({}));
        let list = keys.leave_list(&json!({}));
        for key in [&balance, &balance_stats, &global_stats, &list] {
            cache.set(key.as_str(), "{}", None).await;
        }

        invalidator
            .invalidate_leave_event(&LeaveEvent::BalanceUpdated {
                user_id: "9".to_string(),
                year: 2025,
            })
            .await;
        assert!(!cache.exists(balance.as_str()).await);
        assert!(!cache.exists(balance_stats.as_str()).await);
        assert!(cache.exists(global_stats.as_str()).await);
        assert!(cache.exists(list.as_str()).await);
    }
}
