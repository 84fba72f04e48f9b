//! Per-queue counters for the worker pool.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters for one queue.
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Deliveries picked up by a worker.
    pub started: AtomicU64,
    /// Deliveries whose handler succeeded.
    pub succeeded: AtomicU64,
    /// Deliveries whose handler failed, timed out or panicked.
    pub failed: AtomicU64,
    /// Failures rescheduled for another attempt.
    pub retried: AtomicU64,
    /// Tasks moved to the dead letter list.
    pub dead_lettered: AtomicU64,
    /// Deliveries skipped because the task was cancelled.
    pub cancelled: AtomicU64,
    /// Deliveries that arrived early and were pushed back.
    pub deferred: AtomicU64,
    /// Handlers currently running.
    pub in_flight: AtomicU64,
}

impl QueueStats {
    /// Bump a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the in-flight gauge.
    pub fn finish(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Point-in-time copy.
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`QueueStats`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub cancelled: u64,
    pub deferred: u64,
    pub in_flight: u64,
}

/// Counters for every queue a pool serves.
#[derive(Debug, Default)]
pub struct PoolStats {
    queues: BTreeMap<String, QueueStats>,
}

impl PoolStats {
    /// Create counters for the given queues.
    pub fn new<'a>(queues: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            queues: queues
                .into_iter()
                .map(|q| (q.to_string(), QueueStats::default()))
                .collect(),
        }
    }

    /// Counters for a queue, if it is served.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<&QueueStats> {
        self.queues.get(name)
    }

    /// Snapshot of every queue.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, QueueSnapshot> {
        self.queues
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect()
    }
}
