//! In-process key-value store used when the distributed cache is unavailable.
//!
//! Entries carry an optional absolute expiry and are purged lazily when they
//! are touched. The store is bounded: inserting a new key at capacity first
//! drops expired entries, then evicts the oldest-inserted live entry. Eviction is FIFO, not LRU; overwriting a key
//! keeps its original insertion slot.
//!
//! Insertion order is tracked with a queue of `(sequence, key)` pairs.
//! Deleting or overwriting leaves the old pair behind as a tombstone, which
//! is skipped on eviction and dropped when the queue is compacted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mathilda_core::{CacheError, CacheResult, Clock, SystemClock, DEFAULT_FALLBACK_CAPACITY};

use super::{wildcard_match, KeyTtl, KeyValueBackend};

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Option<DateTime<Utc>>,
    seq: u64,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    order: VecDeque<(u64, String)>,
    next_seq: u64,
}

impl Inner {
    /// Live lookup: expired entries are removed and reported as absent.
    fn live(&mut self, key: &str, now: DateTime<Utc>) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn is_current(&self, seq: u64, key: &str) -> bool {
        self.entries.get(key).is_some_and(|e| e.seq == seq)
    }

    /// Remove the oldest-inserted entry still present.
    fn evict_oldest(&mut self) -> bool {
        while let Some((seq, key)) = self.order.pop_front() {
            if self.is_current(seq, &key) {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }

    /// Drop every expired entry. Their queue pairs become tombstones.
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.entries.retain(|_, e| !e.is_expired(now));
    }

    fn compact(&mut self, capacity: usize) {
        if self.order.len() <= capacity.saturating_mul(2).max(16) {
            return;
        }
        let entries = &self.entries;
        self.order
            .retain(|(seq, key)| entries.get(key).is_some_and(|e| e.seq == *seq));
    }
}

/// Bounded in-process store with lazy expiry and FIFO eviction.
pub struct MemoryStore {
    capacity: usize,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    evictions: AtomicU64,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("capacity", &self.capacity)
            .field("evictions", &self.evictions.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_CAPACITY)
    }
}

impl MemoryStore {
    /// Create a store reading time from the system clock.
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(SystemClock))
    }

    /// Create a store with an injected clock. A capacity of 0 is raised to 1.
    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: capacity.max(1),
            clock,
            inner: Mutex::new(Inner::default()),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries that have not expired.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.lock()
            .map(|inner| inner.entries.values().filter(|e| !e.is_expired(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries removed to make room since the store was created.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn lock(&self) -> CacheResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| CacheError::LockPoisoned)
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(ttl?).ok()?;
        self.clock.now().checked_add_signed(ttl)
    }

    /// Store `value` under `key`, evicting if a new key does not fit.
    fn insert(&self, inner: &mut Inner, key: &str, value: StoredValue, expires_at: Option<DateTime<Utc>>) {
        let now = self.clock.now();
        if let Some(existing) = inner.live(key, now) {
            existing.value = value;
            existing.expires_at = expires_at;
            return;
        }

        // Expired entries give up their slots before any live entry is evicted.
        if inner.entries.len() >= self.capacity {
            inner.purge_expired(now);
        }
        while inner.entries.len() >= self.capacity {
            if !inner.evict_oldest() {
                break;
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.push_back((seq, key.to_string()));
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
                seq,
            },
        );
        inner.compact(self.capacity);
    }
}

#[async_trait]
impl KeyValueBackend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        match inner.live(key, now) {
            Some(Entry {
                value: StoredValue::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(CacheError::WrongType {
                key: key.to_string(),
                operation: "GET".to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let expires_at = self.expiry(ttl);
        let mut inner = self.lock()?;
        self.insert(&mut inner, key, StoredValue::Text(value.to_string()), expires_at);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let removed = inner.entries.remove(key);
        Ok(removed.is_some_and(|e| !e.is_expired(now)))
    }

    async fn delete_many(&self, keys: &[String]) -> CacheResult<u64> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let mut removed = 0;
        for key in keys {
            if inner.entries.remove(key).is_some_and(|e| !e.is_expired(now)) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        Ok(inner.live(key, now).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(Some(ttl));
        let mut inner = self.lock()?;
        match inner.live(key, now) {
            Some(entry) => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let ttl = match inner.live(key, now) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires((*at - now).to_std().unwrap_or_default()),
        };
        Ok(ttl)
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.entries.retain(|_, e| !e.is_expired(now));
        Ok(inner
            .entries
            .keys()
            .filter(|k| wildcard_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn flush(&self) -> CacheResult<()> {
        let mut inner = self.lock()?;
        inner.entries.clear();
        inner.order.clear();
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> CacheResult<Option<String>> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        match inner.live(key, now) {
            Some(Entry {
                value: StoredValue::Hash(fields),
                ..
            }) => Ok(fields.get(field).cloned()),
            Some(_) => Err(CacheError::WrongType {
                key: key.to_string(),
                operation: "HGET".to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        match inner.live(key, now) {
            Some(Entry {
                value: StoredValue::Hash(fields),
                ..
            }) => {
                fields.insert(field.to_string(), value.to_string());
                Ok(())
            }
            Some(_) => Err(CacheError::WrongType {
                key: key.to_string(),
                operation: "HSET".to_string(),
            }),
            None => {
                let fields = HashMap::from([(field.to_string(), value.to_string())]);
                self.insert(&mut inner, key, StoredValue::Hash(fields), None);
                Ok(())
            }
        }
    }

    async fn hgetall(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        match inner.live(key, now) {
            Some(Entry {
                value: StoredValue::Hash(fields),
                ..
            }) => Ok(fields.clone()),
            Some(_) => Err(CacheError::WrongType {
                key: key.to_string(),
                operation: "HGETALL".to_string(),
            }),
            None => Ok(HashMap::new()),
        }
    }

    async fn ping(&self) -> CacheResult<()> {
        self.lock().map(|_| ())
    }
}
