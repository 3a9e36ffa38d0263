//! Redis-protocol backend.
//!
//! Connections are established in a background task so construction and
//! [`connect`](KeyValueBackend::connect) never block the caller; until the
//! task succeeds every command fails with [`CacheError::Unavailable`] and the
//! cache client serves from its fallback store. A command that loses the
//! connection (I/O error, refusal or timeout) drops the shared connection
//! and schedules a reconnect with capped exponential backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use mathilda_core::{CacheError, CacheResult, RedisSettings};
use redis::aio::MultiplexedConnection;
use redis::{Cmd, FromRedisValue, RedisError};
use tokio::sync::watch;

use super::{ConnectionState, KeyTtl, KeyValueBackend};

const BACKEND: &str = "redis";

/// Redis backend over a single multiplexed connection.
pub struct RedisBackend {
    settings: RedisSettings,
    state: RwLock<ConnectionState>,
    connection: RwLock<Option<MultiplexedConnection>>,
    connecting: AtomicBool,
    shutdown: watch::Sender<bool>,
    me: Weak<RedisBackend>,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("url", &self.settings.redacted_url())
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Create a disconnected backend. Call [`connect`](KeyValueBackend::connect)
    /// to start the connection task.
    pub fn new(settings: RedisSettings) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            settings,
            state: RwLock::new(ConnectionState::Disconnected),
            connection: RwLock::new(None),
            connecting: AtomicBool::new(false),
            shutdown,
            me: me.clone(),
        })
    }

    pub fn settings(&self) -> &RedisSettings {
        &self.settings
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut current) = self.state.write() {
            *current = state;
        }
    }

    fn current_connection(&self) -> CacheResult<MultiplexedConnection> {
        let guard = self.connection.read().map_err(|_| CacheError::LockPoisoned)?;
        guard.clone().ok_or_else(|| CacheError::Unavailable {
            backend: BACKEND.to_string(),
        })
    }

    fn store_connection(&self, connection: Option<MultiplexedConnection>) {
        if let Ok(mut guard) = self.connection.write() {
            *guard = connection;
        }
    }

    async fn open(&self) -> CacheResult<MultiplexedConnection> {
        let client = redis::Client::open(self.settings.url()).map_err(|e| CacheError::Connection {
            backend: BACKEND.to_string(),
            reason: e.to_string(),
        })?;

        let limit = self.settings.connect_timeout;
        match tokio::time::timeout(limit, client.get_multiplexed_async_connection()).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => Err(CacheError::Connection {
                backend: BACKEND.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(CacheError::Timeout {
                operation: "CONNECT".to_string(),
                after: limit,
            }),
        }
    }

    /// Retry until connected or shut down.
    async fn connection_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            match self.open().await {
                Ok(connection) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.store_connection(Some(connection));
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(
                        url = %self.settings.redacted_url(),
                        attempts = attempt + 1,
                        "Connected to Redis"
                    );
                    break;
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    let delay = self.settings.backoff_delay(attempt);
                    tracing::warn!(
                        url = %self.settings.redacted_url(),
                        error = %e,
                        attempt = attempt + 1,
                        retry_in_ms = delay.as_millis() as u64,
                        "Redis connection attempt failed"
                    );
                    attempt = attempt.saturating_add(1);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        self.connecting.store(false, Ordering::SeqCst);
        // A connect() that arrived while this loop was exiting on shutdown
        // saw `connecting` still set and left the restart to us.
        if !*self.shutdown.borrow() && self.connection_state() != ConnectionState::Connected {
            self.connect();
        }
    }

    fn on_connection_lost(&self, operation: &str, error: &CacheError) {
        self.store_connection(None);
        self.set_state(ConnectionState::Disconnected);
        tracing::warn!(operation, error = %error, "Redis connection lost");
        if !*self.shutdown.borrow() {
            self.connect();
        }
    }

    async fn run<T: FromRedisValue>(&self, operation: &'static str, cmd: Cmd) -> CacheResult<T> {
        let mut connection = self.current_connection()?;
        let limit = self.settings.command_timeout;

        let result = match tokio::time::timeout(limit, cmd.query_async(&mut connection)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(operation, e)),
            Err(_) => Err(CacheError::Timeout {
                operation: operation.to_string(),
                after: limit,
            }),
        };

        if let Err(e) = &result {
            if e.is_connection_loss() {
                self.on_connection_lost(operation, e);
            }
        }
        result
    }
}

/// Map a client error onto the cache taxonomy.
fn classify(operation: &str, error: RedisError) -> CacheError {
    if error.is_io_error()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.is_timeout()
    {
        CacheError::Connection {
            backend: BACKEND.to_string(),
            reason: error.to_string(),
        }
    } else if error.code() == Some("WRONGTYPE") {
        CacheError::WrongType {
            key: String::new(),
            operation: operation.to_string(),
        }
    } else {
        CacheError::Command {
            operation: operation.to_string(),
            reason: error.to_string(),
        }
    }
}

/// Whole seconds for `EX`/`EXPIRE`, never below one.
fn expiry_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn set_command(key: &str, value: &str, ttl: Option<Duration>) -> Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    match ttl {
        Some(ttl) if ttl.subsec_millis() != 0 && ttl.as_secs() == 0 => {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        Some(ttl) => {
            cmd.arg("EX").arg(expiry_secs(ttl));
        }
        None => {}
    }
    cmd
}

#[async_trait]
impl KeyValueBackend for RedisBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
            .read()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn connect(&self) {
        // Cleared before the `connecting` check: a loop still parked in its
        // backoff after a disconnect must keep retrying.
        self.shutdown.send_replace(false);
        if self.connecting.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.connection_state() == ConnectionState::Connected {
            self.connecting.store(false, Ordering::SeqCst);
            return;
        }
        let Some(this) = self.me.upgrade() else {
            self.connecting.store(false, Ordering::SeqCst);
            return;
        };
        tokio::spawn(this.connection_loop());
    }

    async fn disconnect(&self) {
        self.shutdown.send_replace(true);
        let had_connection = self.current_connection().is_ok();
        self.store_connection(None);
        self.set_state(ConnectionState::Disconnected);
        if had_connection {
            tracing::info!(url = %self.settings.redacted_url(), "Disconnected from Redis");
        }
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run("GET", cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.run("SET", set_command(key, value, ttl)).await
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: u64 = self.run("DEL", cmd).await?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        self.run("DEL", cmd).await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let count: u64 = self.run("EXISTS", cmd).await?;
        Ok(count > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(expiry_secs(ttl));
        let applied: u64 = self.run("EXPIRE", cmd).await?;
        Ok(applied == 1)
    }

    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl> {
        let mut cmd = redis::cmd("TTL");
        cmd.arg(key);
        let reply: i64 = self.run("TTL", cmd).await?;
        Ok(KeyTtl::from_redis_reply(reply))
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut cmd = redis::cmd("KEYS");
        cmd.arg(pattern);
        self.run("KEYS", cmd).await
    }

    async fn flush(&self) -> CacheResult<()> {
        self.run("FLUSHDB", redis::cmd("FLUSHDB")).await
    }

    async fn hget(&self, key: &str, field: &str) -> CacheResult<Option<String>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.run("HGET", cmd).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(field).arg(value);
        let _added: u64 = self.run("HSET", cmd).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.run("HGETALL", cmd).await
    }

    async fn ping(&self) -> CacheResult<()> {
        let _pong: String = self.run("PING", redis::cmd("PING")).await?;
        Ok(())
    }
}
