//! Cache-aside wrapper for data-access calls.
//!
//! A [`Query`] names an entity, an action and the call's arguments as JSON.
//! [`CachingExecutor`] wraps any [`QueryExecutor`]: reads of cacheable
//! entities are looked up under a key derived from `(entity, action, args)`
//! and only reach the inner executor on a miss. Writes always reach the
//! inner executor and, once they succeed, drop the entity's cached reads.
//!
//! Cache trouble never fails a call. Errors from the inner executor are
//! returned unchanged.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mathilda_core::TtlPolicy;

use crate::client::CacheClient;
use crate::invalidation::Invalidator;

/// Data-access action, named as the ORM names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryAction {
    FindUnique,
    FindUniqueOrThrow,
    FindFirst,
    FindFirstOrThrow,
    FindMany,
    Count,
    Aggregate,
    GroupBy,
    Create,
    CreateMany,
    Update,
    UpdateMany,
    Upsert,
    Delete,
    DeleteMany,
}

impl QueryAction {
    /// Actions whose results may be served from the cache.
    pub const READS: [QueryAction; 8] = [
        QueryAction::FindUnique,
        QueryAction::FindUniqueOrThrow,
        QueryAction::FindFirst,
        QueryAction::FindFirstOrThrow,
        QueryAction::FindMany,
        QueryAction::Count,
        QueryAction::Aggregate,
        QueryAction::GroupBy,
    ];

    pub fn is_read(&self) -> bool {
        Self::READS.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FindUnique => "findUnique",
            Self::FindUniqueOrThrow => "findUniqueOrThrow",
            Self::FindFirst => "findFirst",
            Self::FindFirstOrThrow => "findFirstOrThrow",
            Self::FindMany => "findMany",
            Self::Count => "count",
            Self::Aggregate => "aggregate",
            Self::GroupBy => "groupBy",
            Self::Create => "create",
            Self::CreateMany => "createMany",
            Self::Update => "update",
            Self::UpdateMany => "updateMany",
            Self::Upsert => "upsert",
            Self::Delete => "delete",
            Self::DeleteMany => "deleteMany",
        }
    }
}

impl fmt::Display for QueryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One data-access call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub entity: String,
    pub action: QueryAction,
    pub args: Value,
}

impl Query {
    pub fn new(entity: impl Into<String>, action: QueryAction, args: Value) -> Self {
        Self {
            entity: entity.into(),
            action,
            args,
        }
    }
}

/// Something that runs data-access calls.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    type Error: Send;

    async fn execute(&self, query: &Query) -> Result<Value, Self::Error>;
}

#[async_trait]
impl<E> QueryExecutor for Arc<E>
where
    E: QueryExecutor + ?Sized,
{
    type Error = E::Error;

    async fn execute(&self, query: &Query) -> Result<Value, Self::Error> {
        (**self).execute(query).await
    }
}

/// Cache-aside decorator around a [`QueryExecutor`].
pub struct CachingExecutor<E> {
    inner: E,
    cache: Arc<CacheClient>,
    policy: Arc<TtlPolicy>,
    invalidate_on_write: bool,
}

impl<E> CachingExecutor<E> {
    pub fn new(inner: E, cache: Arc<CacheClient>, policy: Arc<TtlPolicy>) -> Self {
        Self {
            inner,
            cache,
            policy,
            invalidate_on_write: true,
        }
    }

    /// Enable or disable dropping an entity's cached reads after a write.
    pub fn with_invalidate_on_write(mut self, enabled: bool) -> Self {
        self.invalidate_on_write = enabled;
        self
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }
}

impl<E: QueryExecutor> CachingExecutor<E> {
    async fn cached_read(&self, query: &Query) -> Result<Value, E::Error> {
        let Some(ttl) = self.policy.ttl_for(&query.entity) else {
            return self.inner.execute(query).await;
        };

        let key = self
            .cache
            .key_space()
            .query(&query.entity, query.action.as_str(), &query.args);

        if let Some(raw) = self.cache.get(key.as_str()).await {
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => {
                    tracing::trace!(key = %key, "Query cache hit");
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Discarding undecodable cached query result");
                }
            }
        }

        let value = self.inner.execute(query).await?;
        self.cache.set(key.as_str(), &value.to_string(), Some(ttl)).await;
        Ok(value)
    }
}

#[async_trait]
impl<E: QueryExecutor> QueryExecutor for CachingExecutor<E> {
    type Error = E::Error;

    async fn execute(&self, query: &Query) -> Result<Value, Self::Error> {
        if query.action.is_read() {
            return self.cached_read(query).await;
        }

        let value = self.inner.execute(query).await?;
        if self.invalidate_on_write {
            Invalidator::new(Arc::clone(&self.cache))
                .invalidate_entity_queries(&query.entity)
                .await;
        }
        Ok(value)
    }
}
