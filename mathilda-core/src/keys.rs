//! Deterministic cache-key derivation.
//!
//! Every key has the shape `namespace:category:...`, where the trailing
//! segment is usually a digest of the call's arguments. Arguments are
//! canonicalised first (object keys sorted at every depth), so two calls
//! that differ only in key order produce the same key.
//!
//! A [`CacheKey`] can only be produced by a [`KeySpace`], which keeps the
//! namespace and category layout in one place; invalidation patterns are
//! built by the same type so they always line up with the keys.

use std::fmt;

use chrono::NaiveDate;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Default namespace for all keys.
pub const DEFAULT_NAMESPACE: &str = "mathilda";

/// Hex characters kept from the SHA-256 digest (64 bits).
const DIGEST_HEX_LEN: usize = 16;

/// Category segment of generic per-entity query cache keys.
pub const QUERY_CATEGORY: &str = "query";

/// A fully-qualified cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Category segment (the one after the namespace).
    pub fn category(&self) -> Option<&str> {
        self.0.split(':').nth(1)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// Builder for keys and invalidation patterns under one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace: String = namespace.into();
        let trimmed = namespace.trim_end_matches(':');
        Self {
            namespace: segment(trimmed),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, parts: &[&str]) -> CacheKey {
        let mut key = self.namespace.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        CacheKey(key)
    }

    fn pattern(&self, parts: &[&str]) -> String {
        self.key(parts).0
    }

    /// Pattern matching every key in this namespace.
    pub fn namespace_pattern(&self) -> String {
        self.pattern(&["*"])
    }

    /// Pattern matching every key of one category.
    pub fn category_pattern(&self, category: &str) -> String {
        self.pattern(&[&segment(category), "*"])
    }

    // === Generic query cache ===

    /// Key for a data-access read: entity, action and argument digest.
    pub fn query(&self, entity: &str, action: &str, args: &Value) -> CacheKey {
        self.key(&[
            QUERY_CATEGORY,
            &segment(entity),
            &segment(action),
            &args_digest(args),
        ])
    }

    /// Pattern matching every cached read of one entity.
    pub fn query_entity_pattern(&self, entity: &str) -> String {
        self.pattern(&[QUERY_CATEGORY, &segment(entity), "*"])
    }

    // === Auth ===

    pub fn auth_session(&self, session_id: &str) -> CacheKey {
        self.key(&["auth", "session", &segment(session_id)])
    }

    pub fn auth_user(&self, user_id: &str) -> CacheKey {
        self.key(&["auth", "user", &segment(user_id)])
    }

    /// Auth entries derived from one user (exact key and sub-keys).
    pub fn auth_user_pattern(&self, user_id: &str) -> String {
        format!("{}*", self.auth_user(user_id))
    }

    // === User ===

    pub fn user_profile(&self, user_id: &str) -> CacheKey {
        self.key(&["user", "profile", &segment(user_id)])
    }

    // === Planning ===

    /// Planning data for an inclusive date range and a filter set.
    pub fn planning_data(&self, start: NaiveDate, end: NaiveDate, filters: &Value) -> CacheKey {
        self.key(&[
            "planning",
            "data",
            &start.to_string(),
            &end.to_string(),
            &args_digest(filters),
        ])
    }

    /// Planning data scoped to a single user.
    pub fn planning_user(&self, user_id: &str, start: NaiveDate, end: NaiveDate) -> CacheKey {
        self.key(&[
            "planning",
            "user",
            &segment(user_id),
            &start.to_string(),
            &end.to_string(),
        ])
    }

    pub fn planning_pattern(&self) -> String {
        self.category_pattern("planning")
    }

    pub fn planning_data_pattern(&self) -> String {
        self.pattern(&["planning", "data", "*"])
    }

    pub fn planning_user_pattern(&self, user_id: &str) -> String {
        self.pattern(&["planning", "user", &segment(user_id), "*"])
    }

    /// Recover the date range encoded in a planning key.
    pub fn planning_range(&self, key: &str) -> Option<(NaiveDate, NaiveDate)> {
        let rest = key.strip_prefix(self.namespace.as_str())?.strip_prefix(":planning:")?;
        let mut parts = rest.split(':');
        let (start, end) = match parts.next()? {
            "data" => (parts.next()?, parts.next()?),
            "user" => {
                parts.next()?;
                (parts.next()?, parts.next()?)
            }
            _ => return None,
        };
        Some((start.parse().ok()?, end.parse().ok()?))
    }

    // === Leaves ===

    pub fn leave_list(&self, filters: &Value) -> CacheKey {
        self.key(&["leaves", "list", &args_digest(filters)])
    }

    pub fn leave_list_pattern(&self) -> String {
        self.pattern(&["leaves", "list", "*"])
    }

    pub fn leave_detail(&self, leave_id: &str) -> CacheKey {
        self.key(&["leaves", "detail", &segment(leave_id)])
    }

    pub fn leave_balance(&self, user_id: &str, year: i32) -> CacheKey {
        self.key(&["leaves", "balance", &segment(user_id), &year.to_string()])
    }

    pub fn leave_balance_pattern(&self, user_id: &str) -> String {
        self.pattern(&["leaves", "balance", &segment(user_id), "*"])
    }

    /// Leaves of one user, optionally restricted to a year.
    pub fn user_leaves(&self, user_id: &str, year: Option<i32>) -> CacheKey {
        match year {
            Some(year) => self.key(&["leaves", "user", &segment(user_id), &year.to_string()]),
            None => self.key(&["leaves", "user", &segment(user_id)]),
        }
    }

    /// The user's leave keys, with or without a year suffix.
    pub fn user_leaves_pattern(&self, user_id: &str) -> String {
        format!("{}*", self.user_leaves(user_id, None))
    }

    /// Statistics keyed by a scope label (`global`, `balance`, `department`...).
    pub fn leave_stats(&self, scope: &str, filters: &Value) -> CacheKey {
        self.key(&["leaves", "stats", &segment(scope), &args_digest(filters)])
    }

    pub fn leave_stats_pattern(&self, scope: Option<&str>) -> String {
        match scope {
            Some(scope) => self.pattern(&["leaves", "stats", &segment(scope), "*"]),
            None => self.pattern(&["leaves", "stats", "*"]),
        }
    }

    pub fn leave_conflicts(&self, params: &Value) -> CacheKey {
        self.key(&["leaves", "conflicts", &args_digest(params)])
    }

    pub fn leave_conflicts_pattern(&self) -> String {
        self.pattern(&["leaves", "conflicts", "*"])
    }

    // === API responses ===

    pub fn api_response(&self, endpoint: &str, params: &Value) -> CacheKey {
        let endpoint = endpoint.trim_matches('/');
        self.key(&["api", &segment(endpoint), &args_digest(params)])
    }

    pub fn api_endpoint_pattern(&self, endpoint: &str) -> String {
        let endpoint = endpoint.trim_matches('/');
        self.pattern(&["api", &segment(endpoint), "*"])
    }

    // === Search ===

    pub fn search_results(&self, scope: &str, params: &Value) -> CacheKey {
        self.key(&["search", &segment(scope), &args_digest(params)])
    }

    pub fn search_pattern(&self) -> String {
        self.category_pattern("search")
    }
}

/// Percent-encode one key segment.
///
/// Only ASCII alphanumerics and `-_.~` survive unchanged, so a segment can
/// never contain the `:` separator or glob syntax (`*`, `?`, `[`, `]`, `\`),
/// and distinct inputs always give distinct segments.
fn segment(raw: &str) -> String {
    urlencoding::encode(raw).into_owned()
}

/// Short, stable digest of a JSON value.
///
/// The value is canonicalised (object keys sorted recursively) before
/// hashing, so argument order never changes the digest.
pub fn args_digest(args: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(args, &mut canonical);
    let hash = Sha256::digest(canonical.as_bytes());
    let mut hex = hex::encode(hash);
    hex.truncate(DIGEST_HEX_LEN);
    hex
}

/// Serialize `value` with object keys in sorted order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(k, out);
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        // Null, bools and numbers have a single JSON rendering.
        other => out.push_str(&other.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_owned()).to_string());
}
