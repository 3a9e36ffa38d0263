//! Mathilda Core - Cache Building Blocks
//!
//! Pure types shared by the cache layer: the error taxonomy, configuration,
//! runtime capability detection, the TTL policy and cache-key derivation.
//! This crate performs no I/O.

pub mod clock;
pub mod config;
pub mod error;
pub mod keys;
pub mod runtime;
pub mod ttl;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, RedisSettings, DEFAULT_FALLBACK_CAPACITY, DEFAULT_SLOW_QUERY_THRESHOLD};
pub use error::{CacheError, CacheResult, ConfigError, MathildaError, MathildaResult};
pub use keys::{args_digest, canonical_json, CacheKey, KeySpace, DEFAULT_NAMESPACE};
pub use runtime::{EnvironmentSignals, Feature, ProcessMode, RuntimeCapabilities};
pub use ttl::{category, TtlPolicy, TtlPolicyBuilder, LEAVE_ENTITIES, PLANNING_ENTITIES, REFERENCE_ENTITIES};

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
