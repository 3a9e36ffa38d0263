//! Key-value backend trait and the types it shares with the cache client.
//!
//! A backend is anything that can hold string values under string keys with
//! an optional expiry: the Redis-protocol store ([`RedisBackend`]) or the
//! in-process map ([`MemoryStore`]). Backends report failures through
//! [`CacheResult`]; turning those failures into fallbacks is the job of
//! [`CacheClient`](crate::CacheClient), not of the backend.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use mathilda_core::CacheResult;
use serde::{Deserialize, Serialize};

pub use self::memory::MemoryStore;
pub use self::redis::RedisBackend;

/// Connection lifecycle of a networked backend.
///
/// `Disconnected -> Connecting -> Connected`, and back to `Disconnected` on
/// any error or close. In-process backends are always `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Remaining lifetime of a key, mirroring the Redis `TTL` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist (Redis `-2`).
    Missing,
    /// The key exists without an expiry (Redis `-1`).
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

impl KeyTtl {
    /// Decode a raw Redis `TTL` reply.
    pub fn from_redis_reply(reply: i64) -> Self {
        match reply {
            -1 => Self::Persistent,
            secs if secs >= 0 => Self::Expires(Duration::from_secs(secs as u64)),
            _ => Self::Missing,
        }
    }

    /// Remaining whole seconds, if the key expires.
    pub fn remaining_secs(&self) -> Option<u64> {
        match self {
            Self::Expires(d) => Some(d.as_secs()),
            _ => None,
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(self, Self::Missing)
    }
}

/// Which backend serves calls while the distributed store is healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Networked store, with the in-process store as fallback.
    Distributed,
    /// In-process store only.
    InMemory,
}

/// Key-value backend trait for pluggable cache stores.
///
/// Values are opaque strings (JSON in practice). Every method may fail;
/// callers that must never fail go through [`CacheClient`](crate::CacheClient).
///
/// # Patterns
///
/// `keys` accepts a glob where only `*` is special.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Current connection state. In-process stores are always connected.
    fn connection_state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    /// Start connecting in the background. Must return immediately.
    fn connect(&self) {}

    /// Close the connection and stop any reconnection attempts.
    async fn disconnect(&self) {}

    /// Get a string value.
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Store a value, overwriting any previous one. `None` TTL means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    /// Delete a key. Returns whether something was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Delete several keys, returning how many existed.
    async fn delete_many(&self, keys: &[String]) -> CacheResult<u64>;

    /// Whether the key exists and has not expired.
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Set a new expiry on an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool>;

    /// Remaining lifetime of a key.
    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl>;

    /// Keys matching a `*` pattern.
    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>>;

    /// Remove every key in the backend's database.
    async fn flush(&self) -> CacheResult<()>;

    /// Read one field of a hash.
    async fn hget(&self, key: &str, field: &str) -> CacheResult<Option<String>>;

    /// Write one field of a hash.
    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()>;

    /// Read a whole hash. Missing keys yield an empty map.
    async fn hgetall(&self, key: &str) -> CacheResult<HashMap<String, String>>;

    /// Round-trip check.
    async fn ping(&self) -> CacheResult<()>;
}

/// Match `key` against a pattern where `*` matches any run of characters.
pub fn wildcard_match(pattern: &str, key: &str) -> bool {
    let p = pattern.as_bytes();
    let k = key.as_bytes();
    let (mut pi, mut ki) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while ki < k.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            resume = ki;
            pi += 1;
        } else if pi < p.len() && p[pi] == k[ki] {
            pi += 1;
            ki += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            ki = resume;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}
