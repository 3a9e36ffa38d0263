//! Cache Configuration Module
//!
//! Connection settings for the distributed cache and tuning knobs for the
//! in-process fallback and the slow-query observer. Configuration is loaded
//! from environment variables with sensible defaults for development.

use std::time::Duration;

use crate::error::ConfigError;
use crate::keys::DEFAULT_NAMESPACE;

/// Default capacity of the in-process fallback store.
pub const DEFAULT_FALLBACK_CAPACITY: usize = 1000;

/// Default slow-query threshold.
pub const DEFAULT_SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(100);

// ============================================================================
// REDIS SETTINGS
// ============================================================================

/// Connection settings for the Redis-protocol store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Numeric database index.
    pub db: i64,
    /// Upper bound for establishing a connection.
    pub connect_timeout: Duration,
    /// Upper bound for a single command round trip.
    pub command_timeout: Duration,
    /// First reconnection delay; doubled after every failed attempt.
    pub reconnect_base_delay: Duration,
    /// Ceiling for the reconnection delay.
    pub reconnect_max_delay: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            connect_timeout: Duration::from_millis(2000),
            command_timeout: Duration::from_millis(500),
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

impl RedisSettings {
    /// Connection URL in `redis://[:password@]host:port/db` form.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                urlencoding::encode(password),
                self.host,
                self.port,
                self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Same as [`url`](Self::url) with the password masked, for logs.
    pub fn redacted_url(&self) -> String {
        match self.password {
            Some(_) => format!("redis://:***@{}:{}/{}", self.host, self.port, self.db),
            None => self.url(),
        }
    }

    /// Reconnection delay after `attempt` consecutive failures (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.reconnect_base_delay
            .saturating_mul(factor)
            .min(self.reconnect_max_delay)
    }
}

// ============================================================================
// CACHE CONFIGURATION
// ============================================================================

/// Configuration for the cache layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Distributed store connection.
    pub redis: RedisSettings,
    /// Namespace prefix for every key.
    pub key_prefix: String,
    /// Master switch for the distributed store. When false only the
    /// in-process store is used.
    pub enabled: bool,
    /// Maximum entries kept by the in-process fallback store.
    pub fallback_capacity: usize,
    /// Reads slower than this are reported.
    pub slow_query_threshold: Duration,
    /// Invalidate an entity's cached reads after a successful write.
    pub invalidate_on_write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis: RedisSettings::default(),
            key_prefix: DEFAULT_NAMESPACE.to_string(),
            enabled: true,
            fallback_capacity: DEFAULT_FALLBACK_CAPACITY,
            slow_query_threshold: DEFAULT_SLOW_QUERY_THRESHOLD,
            invalidate_on_write: true,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create CacheConfig from environment variables.
    ///
    /// Environment variables:
    /// - `MATHILDA_REDIS_HOST`: Cache host (default: localhost)
    /// - `MATHILDA_REDIS_PORT`: Cache port (default: 6379)
    /// - `MATHILDA_REDIS_PASSWORD`: Optional password
    /// - `MATHILDA_REDIS_DB`: Database index (default: 0)
    /// - `MATHILDA_REDIS_CONNECT_TIMEOUT_MS`: Connect timeout (default: 2000)
    /// - `MATHILDA_REDIS_COMMAND_TIMEOUT_MS`: Command timeout (default: 500)
    /// - `MATHILDA_CACHE_PREFIX`: Key namespace (default: mathilda)
    /// - `MATHILDA_CACHE_ENABLED`: "false" disables the distributed store (default: true)
    /// - `MATHILDA_CACHE_FALLBACK_CAPACITY`: Fallback entries (default: 1000)
    /// - `MATHILDA_SLOW_QUERY_THRESHOLD_MS`: Slow-query threshold (default: 100)
    /// - `MATHILDA_CACHE_INVALIDATE_ON_WRITE`: "false" disables write invalidation (default: true)
    pub fn from_env() -> Self {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable lookup.
    pub fn from_source<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse_ms = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        let redis = RedisSettings {
            host: lookup("MATHILDA_REDIS_HOST")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.redis.host),
            port: lookup("MATHILDA_REDIS_PORT")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.redis.port),
            password: lookup("MATHILDA_REDIS_PASSWORD").filter(|s| !s.is_empty()),
            db: lookup("MATHILDA_REDIS_DB")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.redis.db),
            connect_timeout: parse_ms(
                "MATHILDA_REDIS_CONNECT_TIMEOUT_MS",
                defaults.redis.connect_timeout,
            ),
            command_timeout: parse_ms(
                "MATHILDA_REDIS_COMMAND_TIMEOUT_MS",
                defaults.redis.command_timeout,
            ),
            reconnect_base_delay: defaults.redis.reconnect_base_delay,
            reconnect_max_delay: defaults.redis.reconnect_max_delay,
        };

        Self {
            redis,
            key_prefix: lookup("MATHILDA_CACHE_PREFIX")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.key_prefix),
            enabled: lookup("MATHILDA_CACHE_ENABLED")
                .map(|s| s.to_lowercase() != "false")
                .unwrap_or(true),
            fallback_capacity: lookup("MATHILDA_CACHE_FALLBACK_CAPACITY")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.fallback_capacity),
            slow_query_threshold: parse_ms(
                "MATHILDA_SLOW_QUERY_THRESHOLD_MS",
                defaults.slow_query_threshold,
            ),
            invalidate_on_write: lookup("MATHILDA_CACHE_INVALIDATE_ON_WRITE")
                .map(|s| s.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Enable or disable the distributed store.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the fallback capacity.
    pub fn with_fallback_capacity(mut self, capacity: usize) -> Self {
        self.fallback_capacity = capacity;
        self
    }

    /// Set the slow-query threshold.
    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    /// Set the Redis settings.
    pub fn with_redis(mut self, redis: RedisSettings) -> Self {
        self.redis = redis;
        self
    }

    /// Enable or disable invalidation after writes.
    pub fn with_invalidate_on_write(mut self, enabled: bool) -> Self {
        self.invalidate_on_write = enabled;
        self
    }

    /// Check the configuration for values the cache cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis.host.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "redis.host".to_string(),
            });
        }
        if self.redis.port == 0 {
            return Err(invalid("redis.port", "0", "port must be non-zero"));
        }
        if self.redis.db < 0 {
            return Err(invalid(
                "redis.db",
                &self.redis.db.to_string(),
                "database index must not be negative",
            ));
        }
        if self.redis.connect_timeout.is_zero() || self.redis.command_timeout.is_zero() {
            return Err(invalid("redis.timeouts", "0", "timeouts must be non-zero"));
        }
        if self.redis.reconnect_base_delay > self.redis.reconnect_max_delay {
            return Err(invalid(
                "redis.reconnect_base_delay",
                &format!("{:?}", self.redis.reconnect_base_delay),
                "must not exceed reconnect_max_delay",
            ));
        }
        if self.key_prefix.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "key_prefix".to_string(),
            });
        }
        if self.key_prefix.contains(['*', ' ']) {
            return Err(invalid(
                "key_prefix",
                &self.key_prefix,
                "must not contain wildcards or spaces",
            ));
        }
        if self.fallback_capacity == 0 {
            return Err(invalid(
                "fallback_capacity",
                "0",
                "fallback store needs room for at least one entry",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
