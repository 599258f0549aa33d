//! Client-side request metrics.
//!
//! Every [`CouchInstance`](crate::CouchInstance) owns a [`Metrics`]
//! collector shared by all of its databases. Each logical request is counted
//! under its operation name (`read_doc`, `save_doc`, `read_doc_range`, ...)
//! together with its latency and outcome; the retry loop adds the number of
//! retries and of requests that gave up after retrying.
//!
//! Latency covers the whole logical request, retries and backoff included.
//! A `NotFound` answer is not an error here: callers treat it as absence.
//!
//! # Memory Ordering
//!
//! Global counters use `Ordering::Relaxed`. Each counter is independent and
//! only ever incremented, so a snapshot may show counters from slightly
//! different instants; that is fine for telemetry. Per-operation statistics
//! live behind a [`parking_lot::Mutex`] held for a single update.
//!
//! # Usage
//!
//! ```
//! use std::time::Duration;
//! use statedb_couchdb::Metrics;
//!
//! let metrics = Metrics::new();
//! metrics.record_operation("read_doc", Duration::from_micros(100), None);
//! metrics.record_operation("read_doc", Duration::from_micros(300), None);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.request_count, 2);
//! let reads = snapshot.operation("read_doc").expect("recorded");
//! assert_eq!(reads.avg_latency_us(), 200.0);
//! ```

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::error::CouchError;

/// Number of latency samples retained per operation.
const LATENCY_WINDOW_SIZE: usize = 1024;

/// Latency percentiles for one operation, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyPercentiles {
    /// 50th percentile (median) latency in microseconds.
    pub p50: u64,
    /// 95th percentile latency in microseconds.
    pub p95: u64,
    /// 99th percentile latency in microseconds.
    pub p99: u64,
}

/// A bounded circular buffer of the most recent latency samples.
struct LatencyWindow {
    buf: Vec<u64>,
    pos: usize,
}

impl LatencyWindow {
    fn new() -> Self {
        Self { buf: Vec::new(), pos: 0 }
    }

    fn record(&mut self, value_us: u64) {
        if self.buf.len() < LATENCY_WINDOW_SIZE {
            self.buf.push(value_us);
        } else {
            self.buf[self.pos] = value_us;
        }
        self.pos = (self.pos + 1) % LATENCY_WINDOW_SIZE;
    }

    fn percentiles(&self) -> LatencyPercentiles {
        if self.buf.is_empty() {
            return LatencyPercentiles::default();
        }
        let mut sorted = self.buf.clone();
        sorted.sort_unstable();
        let len = sorted.len();
        LatencyPercentiles {
            p50: sorted[percentile_index(len, 50)],
            p95: sorted[percentile_index(len, 95)],
            p99: sorted[percentile_index(len, 99)],
        }
    }
}

/// Nearest-rank index: `ceil(percentile/100 * len) - 1`, clamped to the slice.
fn percentile_index(len: usize, percentile: u32) -> usize {
    if len == 0 {
        return 0;
    }
    let rank = (u64::from(percentile) * len as u64).div_ceil(100) as usize;
    rank.saturating_sub(1).min(len - 1)
}

struct OperationStats {
    count: u64,
    error_count: u64,
    latency_us: u64,
    window: LatencyWindow,
}

impl OperationStats {
    fn new() -> Self {
        Self { count: 0, error_count: 0, latency_us: 0, window: LatencyWindow::new() }
    }
}

/// Counters for one operation name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationSnapshot {
    /// Operation name, e.g. `read_doc`.
    pub operation: String,
    /// Logical requests made.
    pub count: u64,
    /// Requests that ended in an error.
    pub error_count: u64,
    /// Total latency in microseconds.
    pub latency_us: u64,
    /// Percentiles over the most recent requests.
    pub percentiles: LatencyPercentiles,
}

impl OperationSnapshot {
    /// Average latency in microseconds, or `0.0` before the first request.
    #[must_use]
    pub fn avg_latency_us(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.latency_us as f64 / self.count as f64 }
    }

    /// Fraction of requests that failed.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.error_count as f64 / self.count as f64 }
    }
}

/// Point-in-time copy of a [`Metrics`] collector.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Logical requests across all operations.
    pub request_count: u64,
    /// Requests that ended in an error.
    pub error_count: u64,
    /// Requests rejected with a revision conflict. Included in `error_count`.
    pub conflict_count: u64,
    /// Individual retry attempts made after transient failures.
    pub retry_count: u64,
    /// Requests that still failed after retrying.
    pub retry_exhausted_count: u64,
    /// Per-operation breakdown, busiest first.
    pub operations: Vec<OperationSnapshot>,
}

impl MetricsSnapshot {
    /// Returns the counters recorded under `operation`, if any.
    #[must_use]
    pub fn operation(&self, operation: &str) -> Option<&OperationSnapshot> {
        self.operations.iter().find(|op| op.operation == operation)
    }

    /// Fraction of requests that failed.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.request_count as f64
    }
}

/// Collects request counts, latencies, errors and retries for an instance.
///
/// Cloning is cheap; clones record into the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    request_count: AtomicU64,
    error_count: AtomicU64,
    conflict_count: AtomicU64,
    retry_count: AtomicU64,
    retry_exhausted_count: AtomicU64,
    // Keyed by the fixed set of operation names the client uses.
    operations: Mutex<HashMap<String, OperationStats>>,
}

impl Metrics {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                request_count: AtomicU64::new(0),
                error_count: AtomicU64::new(0),
                conflict_count: AtomicU64::new(0),
                retry_count: AtomicU64::new(0),
                retry_exhausted_count: AtomicU64::new(0),
                operations: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Records one logical request of `operation` that took `duration` and
    /// failed with `error`, if it failed.
    pub fn record_operation(
        &self,
        operation: &str,
        duration: Duration,
        error: Option<&CouchError>,
    ) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let failed = match error {
            None | Some(CouchError::NotFound { .. }) => false,
            Some(CouchError::Conflict { .. }) => {
                self.inner.conflict_count.fetch_add(1, Ordering::Relaxed);
                true
            },
            Some(_) => true,
        };

        self.inner.request_count.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.inner.error_count.fetch_add(1, Ordering::Relaxed);
        }

        let mut operations = self.inner.operations.lock();
        let stats = operations.entry(operation.to_owned()).or_insert_with(OperationStats::new);
        stats.count += 1;
        stats.latency_us = stats.latency_us.saturating_add(us);
        if failed {
            stats.error_count += 1;
        }
        stats.window.record(us);
    }

    /// Records a retry attempt.
    ///
    /// Counts individual retries, not requests that were retried.
    pub fn record_retry(&self) {
        self.inner.retry_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a request that failed after all of its retries.
    pub fn record_retry_exhausted(&self) {
        self.inner.retry_exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut operations: Vec<OperationSnapshot> = self
            .inner
            .operations
            .lock()
            .iter()
            .map(|(name, stats)| OperationSnapshot {
                operation: name.clone(),
                count: stats.count,
                error_count: stats.error_count,
                latency_us: stats.latency_us,
                percentiles: stats.window.percentiles(),
            })
            .collect();
        operations
            .sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.operation.cmp(&b.operation)));

        MetricsSnapshot {
            request_count: self.inner.request_count.load(Ordering::Relaxed),
            error_count: self.inner.error_count.load(Ordering::Relaxed),
            conflict_count: self.inner.conflict_count.load(Ordering::Relaxed),
            retry_count: self.inner.retry_count.load(Ordering::Relaxed),
            retry_exhausted_count: self.inner.retry_exhausted_count.load(Ordering::Relaxed),
            operations,
        }
    }

    /// Resets all counters to zero.
    pub fn reset(&self) {
        self.inner.request_count.store(0, Ordering::Relaxed);
        self.inner.error_count.store(0, Ordering::Relaxed);
        self.inner.conflict_count.store(0, Ordering::Relaxed);
        self.inner.retry_count.store(0, Ordering::Relaxed);
        self.inner.retry_exhausted_count.store(0, Ordering::Relaxed);
        self.inner.operations.lock().clear();
    }

    /// Logs the current counters at INFO level, warning when more than 5% of
    /// requests failed.
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        if snapshot.request_count == 0 {
            return;
        }

        tracing::info!(
            request_count = snapshot.request_count,
            error_count = snapshot.error_count,
            conflict_count = snapshot.conflict_count,
            retry_count = snapshot.retry_count,
            retry_exhausted_count = snapshot.retry_exhausted_count,
            "CouchDB client metrics snapshot"
        );
        for op in &snapshot.operations {
            tracing::info!(
                operation = %op.operation,
                count = op.count,
                error_count = op.error_count,
                avg_latency_us = op.avg_latency_us(),
                p99_us = op.percentiles.p99,
                "operation metrics"
            );
        }

        if snapshot.error_rate() > 0.05 {
            tracing::warn!(
                error_rate = snapshot.error_rate(),
                error_count = snapshot.error_count,
                request_count = snapshot.request_count,
                "high CouchDB error rate"
            );
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("request_count", &self.inner.request_count.load(Ordering::Relaxed))
            .field("error_count", &self.inner.error_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
