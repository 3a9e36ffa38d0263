//! Slow-query observation.
//!
//! [`ObservedExecutor`] times every call of the executor it wraps, feeds the
//! duration histogram, and hands calls slower than the threshold to the
//! configured [`SlowQuerySink`]s. It never changes the call's result.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use mathilda_core::{Timestamp, DEFAULT_SLOW_QUERY_THRESHOLD};

use crate::metrics::CacheMetrics;
use crate::query::{Query, QueryAction, QueryExecutor};

/// Argument snapshots longer than this are truncated.
const MAX_ARGS_SNAPSHOT_CHARS: usize = 2048;

/// A call that exceeded the slow-query threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQueryRecord {
    pub entity: String,
    pub action: QueryAction,
    pub duration_ms: u64,
    pub args_snapshot: Value,
    pub timestamp: Timestamp,
}

impl SlowQueryRecord {
    fn from_query(query: &Query, elapsed: Duration) -> Self {
        Self {
            entity: query.entity.clone(),
            action: query.action,
            duration_ms: elapsed.as_millis() as u64,
            args_snapshot: snapshot(&query.args),
            timestamp: chrono::Utc::now(),
        }
    }
}

fn snapshot(args: &Value) -> Value {
    let rendered = args.to_string();
    if rendered.chars().count() <= MAX_ARGS_SNAPSHOT_CHARS {
        return args.clone();
    }
    let truncated: String = rendered.chars().take(MAX_ARGS_SNAPSHOT_CHARS).collect();
    Value::String(format!("{}...", truncated))
}

/// Destination for slow-query records. Must not block.
pub trait SlowQuerySink: Send + Sync {
    fn record(&self, record: &SlowQueryRecord);
}

/// Logs each slow query at `warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl SlowQuerySink for TracingSink {
    fn record(&self, record: &SlowQueryRecord) {
        tracing::warn!(
            entity = %record.entity,
            action = %record.action,
            duration_ms = record.duration_ms,
            "Slow query"
        );
    }
}

/// Keeps the most recent slow queries in memory.
#[derive(Debug)]
pub struct SlowQueryLog {
    capacity: usize,
    records: Mutex<VecDeque<SlowQueryRecord>>,
}

impl SlowQueryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<SlowQueryRecord> {
        self.records
            .lock()
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }
}

impl SlowQuerySink for SlowQueryLog {
    fn record(&self, record: &SlowQueryRecord) {
        if let Ok(mut records) = self.records.lock() {
            if records.len() >= self.capacity {
                records.pop_front();
            }
            records.push_back(record.clone());
        }
    }
}

/// Forwards records to a channel for best-effort persistence.
///
/// Records are dropped when the channel is full or closed.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<SlowQueryRecord>,
}

impl ChannelSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<SlowQueryRecord>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl SlowQuerySink for ChannelSink {
    fn record(&self, record: &SlowQueryRecord) {
        if let Err(e) = self.tx.try_send(record.clone()) {
            tracing::debug!(error = %e, "Dropping slow query record");
        }
    }
}

/// Threshold plus the sinks slow calls are reported to.
pub struct SlowQueryObserver {
    threshold: Duration,
    sinks: Vec<Arc<dyn SlowQuerySink>>,
    metrics: Option<Arc<CacheMetrics>>,
}

impl std::fmt::Debug for SlowQueryObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlowQueryObserver")
            .field("threshold", &self.threshold)
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

impl Default for SlowQueryObserver {
    fn default() -> Self {
        Self::new(DEFAULT_SLOW_QUERY_THRESHOLD)
    }
}

impl SlowQueryObserver {
    /// An observer that logs slow queries through [`TracingSink`].
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            sinks: vec![Arc::new(TracingSink)],
            metrics: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn SlowQuerySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Account for one finished call. Returns the record if it was slow.
    pub fn observe(&self, query: &Query, elapsed: Duration) -> Option<SlowQueryRecord> {
        if let Some(metrics) = &self.metrics {
            metrics.record_query(&query.entity, query.action.as_str(), elapsed.as_secs_f64());
        }
        if elapsed <= self.threshold {
            return None;
        }

        let record = SlowQueryRecord::from_query(query, elapsed);
        if let Some(metrics) = &self.metrics {
            metrics.record_slow_query(&record.entity);
        }
        for sink in &self.sinks {
            sink.record(&record);
        }
        Some(record)
    }
}

/// Timing decorator around a [`QueryExecutor`].
pub struct ObservedExecutor<E> {
    inner: E,
    observer: Arc<SlowQueryObserver>,
}

impl<E> ObservedExecutor<E> {
    pub fn new(inner: E, observer: Arc<SlowQueryObserver>) -> Self {
        Self { inner, observer }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

#[async_trait]
impl<E: QueryExecutor> QueryExecutor for ObservedExecutor<E> {
    type Error = E::Error;

    async fn execute(&self, query: &Query) -> Result<Value, Self::Error> {
        let started = Instant::now();
        let result = self.inner.execute(query).await;
        self.observer.observe(query, started.elapsed());
        result
    }
}
