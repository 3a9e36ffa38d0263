//! Per-entity time-to-live policy.
//!
//! A [`TtlPolicy`] maps entity and category names to a lifetime in seconds.
//! It is assembled once at startup and only read afterwards. A zero or
//! missing TTL means "do not cache".

use std::collections::HashMap;
use std::time::Duration;

/// Static reference data (sites, sectors, activity types).
pub const TTL_REFERENCE_DATA: u64 = 24 * 60 * 60;
/// Application settings.
pub const TTL_SETTINGS: u64 = 60 * 60;
/// User profiles.
pub const TTL_USER_PROFILE: u64 = 10 * 60;
/// Planning data.
pub const TTL_PLANNING: u64 = 5 * 60;
/// Cached reads of leave entities.
pub const TTL_LEAVES: u64 = 30 * 60;
/// Filtered leave lists.
pub const TTL_LEAVE_LIST: u64 = 60 * 60;
/// A single leave.
pub const TTL_LEAVE_DETAIL: u64 = 24 * 60 * 60;
/// Leave balances per user and year.
pub const TTL_LEAVE_BALANCE: u64 = 2 * 60 * 60;
/// Leave statistics.
pub const TTL_LEAVE_STATS: u64 = 12 * 60 * 60;
/// The leaves of one user.
pub const TTL_USER_LEAVES: u64 = 30 * 60;
/// Conflict checks are short-lived.
pub const TTL_LEAVE_CONFLICTS: u64 = 10 * 60;
/// Authentication lookups.
pub const TTL_AUTH: u64 = 15 * 60;
/// Cached HTTP API responses.
pub const TTL_API: u64 = 60;
/// Search results.
pub const TTL_SEARCH: u64 = 2 * 60;

/// Entities that rarely change.
pub const REFERENCE_ENTITIES: &[&str] = &[
    "Site",
    "Sector",
    "OperatingRoom",
    "OperatingSector",
    "ActivityType",
    "LeaveType",
    "RequestType",
    "Specialty",
    "Skill",
    "Surgeon",
];

pub const PLANNING_ENTITIES: &[&str] = &[
    "Planning",
    "Assignment",
    "BlocDayPlanning",
    "BlocRoomAssignment",
    "TrameModele",
    "AffectationModele",
];

pub const LEAVE_ENTITIES: &[&str] = &["Leave", "LeaveBalance", "QuotaTransfer", "QuotaCarryOver"];

/// Named cache categories used by the domain helpers.
pub mod category {
    pub const AUTH: &str = "auth";
    pub const USER: &str = "user";
    pub const PLANNING: &str = "planning";
    pub const LEAVES: &str = "leaves";
    pub const API: &str = "api";
    pub const SEARCH: &str = "search";

    pub const LEAVE_LIST: &str = "leaves.list";
    pub const LEAVE_DETAIL: &str = "leaves.detail";
    pub const LEAVE_BALANCE: &str = "leaves.balance";
    pub const LEAVE_STATS: &str = "leaves.stats";
    pub const USER_LEAVES: &str = "leaves.user";
    pub const LEAVE_CONFLICTS: &str = "leaves.conflicts";
}

/// Immutable mapping from entity/category name to TTL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TtlPolicy {
    ttls: HashMap<String, u64>,
}

impl TtlPolicy {
    /// A policy with no entries: nothing is cached.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Start building a policy from the defaults.
    pub fn builder() -> TtlPolicyBuilder {
        TtlPolicyBuilder {
            ttls: Self::standard().ttls,
        }
    }

    /// The default policy for the planning application.
    pub fn standard() -> Self {
        let mut ttls = HashMap::new();
        for entity in REFERENCE_ENTITIES {
            ttls.insert((*entity).to_string(), TTL_REFERENCE_DATA);
        }
        for entity in PLANNING_ENTITIES {
            ttls.insert((*entity).to_string(), TTL_PLANNING);
        }
        for entity in LEAVE_ENTITIES {
            ttls.insert((*entity).to_string(), TTL_LEAVES);
        }
        ttls.insert("User".to_string(), TTL_USER_PROFILE);
        ttls.insert("Settings".to_string(), TTL_SETTINGS);
        ttls.insert("AppearanceSettings".to_string(), TTL_SETTINGS);

        ttls.insert(category::AUTH.to_string(), TTL_AUTH);
        ttls.insert(category::USER.to_string(), TTL_USER_PROFILE);
        ttls.insert(category::PLANNING.to_string(), TTL_PLANNING);
        ttls.insert(category::LEAVES.to_string(), TTL_LEAVES);
        ttls.insert(category::API.to_string(), TTL_API);
        ttls.insert(category::SEARCH.to_string(), TTL_SEARCH);

        ttls.insert(category::LEAVE_LIST.to_string(), TTL_LEAVE_LIST);
        ttls.insert(category::LEAVE_DETAIL.to_string(), TTL_LEAVE_DETAIL);
        ttls.insert(category::LEAVE_BALANCE.to_string(), TTL_LEAVE_BALANCE);
        ttls.insert(category::LEAVE_STATS.to_string(), TTL_LEAVE_STATS);
        ttls.insert(category::USER_LEAVES.to_string(), TTL_USER_LEAVES);
        ttls.insert(category::LEAVE_CONFLICTS.to_string(), TTL_LEAVE_CONFLICTS);

        Self { ttls }
    }

    /// TTL in whole seconds, `0` when not cached.
    pub fn ttl_secs(&self, name: &str) -> u64 {
        self.ttls.get(name).copied().unwrap_or(0)
    }

    /// TTL for `name`, or `None` when the entity must not be cached.
    pub fn ttl_for(&self, name: &str) -> Option<Duration> {
        match self.ttl_secs(name) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Whether results for `name` are cached at all.
    pub fn is_cacheable(&self, name: &str) -> bool {
        self.ttl_secs(name) > 0
    }

    /// Number of configured names.
    pub fn len(&self) -> usize {
        self.ttls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ttls.is_empty()
    }
}

/// Builder for [`TtlPolicy`].
#[derive(Debug, Clone)]
pub struct TtlPolicyBuilder {
    ttls: HashMap<String, u64>,
}

impl TtlPolicyBuilder {
    /// Set the TTL for one entity or category. `0` disables caching for it.
    pub fn with_ttl(mut self, name: impl Into<String>, secs: u64) -> Self {
        self.ttls.insert(name.into(), secs);
        self
    }

    /// Remove an entry so the name falls back to "not cached".
    pub fn without(mut self, name: &str) -> Self {
        self.ttls.remove(name);
        self
    }

    /// Start from an empty table instead of the defaults.
    pub fn cleared(mut self) -> Self {
        self.ttls.clear();
        self
    }

    pub fn build(self) -> TtlPolicy {
        TtlPolicy { ttls: self.ttls }
    }
}
