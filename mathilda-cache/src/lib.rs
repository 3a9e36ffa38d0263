//! Mathilda Cache - Query Caching and Invalidation
//!
//! Cache-aside layer in front of the data-access layer:
//!
//! - [`CacheClient`]: never-failing facade over the Redis backend with an
//!   in-process fallback store
//! - [`CachingExecutor`]: per-entity read caching with deterministic keys
//! - [`ObservedExecutor`]: slow-query timing and reporting
//! - [`Invalidator`]: explicit invalidation after writes
//! - [`DomainCache`]: typed helpers for profiles, planning, API and search
//! - [`CacheService`]: composition root built once by the host
//!
//! # Example
//!
//! ```ignore
//! let service = CacheService::from_env()?;
//! service.connect();
//! let db = service.data_access(prisma_executor);
//! let sites = db.execute(&Query::new("Site", QueryAction::FindMany, json!({}))).await?;
//! ```

pub mod backend;
pub mod client;
pub mod domain;
pub mod invalidation;
pub mod metrics;
pub mod observer;
pub mod query;
pub mod service;
pub mod telemetry;

pub use backend::{
    wildcard_match, BackendKind, ConnectionState, KeyTtl, KeyValueBackend, MemoryStore,
    RedisBackend,
};
pub use client::{build_cache_client, CacheClient, CacheStats};
pub use domain::DomainCache;
pub use invalidation::{Invalidator, LeaveEvent, LeaveRef};
pub use metrics::CacheMetrics;
pub use observer::{
    ChannelSink, ObservedExecutor, SlowQueryLog, SlowQueryObserver, SlowQueryRecord,
    SlowQuerySink, TracingSink,
};
pub use query::{CachingExecutor, Query, QueryAction, QueryExecutor};
pub use service::CacheService;
