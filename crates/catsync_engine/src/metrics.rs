//! Counters and per-batch history.

use catsync_core::{BatchId, BatchStats, BatchStatus, ChangeType, Priority, SyncBatch};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Batches kept in the history ring.
pub const HISTORY_CAPACITY: usize = 1000;

/// Outcome of one finished batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchRecord {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Scheduling priority.
    pub priority: Priority,
    /// Shared change type.
    pub change_type: ChangeType,
    /// Final status.
    pub status: BatchStatus,
    /// Item outcomes.
    pub stats: BatchStats,
    /// Pickups it took.
    pub attempts: u32,
    /// Wall-clock duration from first start to finish.
    pub duration: Duration,
}

impl BatchRecord {
    /// Builds a record from a finished batch.
    pub fn from_batch(batch: &SyncBatch) -> Self {
        Self {
            batch_id: batch.id,
            priority: batch.priority,
            change_type: batch.change_type,
            status: batch.status,
            stats: batch.stats,
            attempts: batch.attempts,
            duration: Duration::from_millis(batch.duration_ms().unwrap_or(0)),
        }
    }
}

/// Aggregated engine metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Items waiting per priority (unbatched plus formed but not started).
    pub queue_depth_by_priority: BTreeMap<Priority, usize>,
    /// Workers currently running.
    pub active_workers: usize,
    /// Applied items over items that reached applied or failed.
    pub success_rate: f64,
    /// Mean duration of finished batches.
    pub avg_batch_duration: Duration,
    /// Batches picked up by a worker.
    pub batches_started: u64,
    /// Batches that completed.
    pub batches_completed: u64,
    /// Batches that failed.
    pub batches_failed: u64,
    /// Batches put back on the queue after a crash or timeout.
    pub batches_requeued: u64,
    /// Batches rolled back.
    pub batches_rolled_back: u64,
    /// Items applied.
    pub items_succeeded: u64,
    /// Items failed.
    pub items_failed: u64,
    /// Items skipped.
    pub items_skipped: u64,
    /// Throttle signals received.
    pub throttle_events: u64,
    /// Transient retries performed.
    pub retries: u64,
    /// Most recent batch outcomes, oldest first.
    pub recent_batches: Vec<BatchRecord>,
}

/// Engine-wide counters.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    batches_started: AtomicU64,
    batches_completed: AtomicU64,
    batches_failed: AtomicU64,
    batches_requeued: AtomicU64,
    batches_rolled_back: AtomicU64,
    items_succeeded: AtomicU64,
    items_failed: AtomicU64,
    items_skipped: AtomicU64,
    throttle_events: AtomicU64,
    retries: AtomicU64,
    history: Mutex<VecDeque<BatchRecord>>,
}

impl SyncMetrics {
    /// Creates zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn batch_started(&self) {
        self.batches_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn batch_requeued(&self) {
        self.batches_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn batch_rolled_back(&self) {
        self.batches_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn item_succeeded(&self) {
        self.items_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn item_failed(&self) {
        self.items_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn item_skipped(&self) {
        self.items_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn throttled(&self) {
        self.throttle_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a finished batch.
    pub(crate) fn batch_finished(&self, batch: &SyncBatch) {
        match batch.status {
            BatchStatus::Completed => self.batches_completed.fetch_add(1, Ordering::Relaxed),
            BatchStatus::Failed => self.batches_failed.fetch_add(1, Ordering::Relaxed),
            _ => return,
        };
        let mut history = self.history.lock();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(BatchRecord::from_batch(batch));
    }

    /// History ring, oldest first.
    pub fn history(&self) -> Vec<BatchRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Builds a snapshot with the caller's live gauges.
    pub fn snapshot(
        &self,
        queue_depth_by_priority: BTreeMap<Priority, usize>,
        active_workers: usize,
    ) -> MetricsSnapshot {
        let recent_batches = self.history();
        let succeeded = self.items_succeeded.load(Ordering::Relaxed);
        let failed = self.items_failed.load(Ordering::Relaxed);
        let success_rate = if succeeded + failed == 0 {
            1.0
        } else {
            succeeded as f64 / (succeeded + failed) as f64
        };
        let avg_batch_duration = if recent_batches.is_empty() {
            Duration::ZERO
        } else {
            recent_batches.iter().map(|r| r.duration).sum::<Duration>()
                / recent_batches.len() as u32
        };

        MetricsSnapshot {
            queue_depth_by_priority,
            active_workers,
            success_rate,
            avg_batch_duration,
            batches_started: self.batches_started.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_requeued: self.batches_requeued.load(Ordering::Relaxed),
            batches_rolled_back: self.batches_rolled_back.load(Ordering::Relaxed),
            items_succeeded: succeeded,
            items_failed: failed,
            items_skipped: self.items_skipped.load(Ordering::Relaxed),
            throttle_events: self.throttle_events.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            recent_batches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catsync_core::{ChangeId, Timestamp};

    fn finished(status: BatchStatus, millis: u64) -> SyncBatch {
        let mut batch = SyncBatch::new(Priority::Normal, ChangeType::Update, vec![ChangeId::new()]);
        batch.status = status;
        batch.started_at = Some(Timestamp(1_000));
        batch.completed_at = Some(Timestamp(1_000 + millis));
        batch
    }

    #[test]
    fn success_rate_and_average_duration() {
        let metrics = SyncMetrics::new();
        assert_eq!(metrics.snapshot(BTreeMap::new(), 0).success_rate, 1.0);

        for _ in 0..3 {
            metrics.item_succeeded();
        }
        metrics.item_failed();
        metrics.batch_finished(&finished(BatchStatus::Completed, 100));
        metrics.batch_finished(&finished(BatchStatus::Failed, 300));

        let snapshot = metrics.snapshot(BTreeMap::new(), 2);
        assert_eq!(snapshot.success_rate, 0.75);
        assert_eq!(snapshot.avg_batch_duration, Duration::from_millis(200));
        assert_eq!(snapshot.batches_completed, 1);
        assert_eq!(snapshot.batches_failed, 1);
        assert_eq!(snapshot.active_workers, 2);
    }

    #[test]
    fn history_is_bounded() {
        let metrics = SyncMetrics::new();
        for _ in 0..HISTORY_CAPACITY + 5 {
            metrics.batch_finished(&finished(BatchStatus::Completed, 1));
        }
        assert_eq!(metrics.history().len(), HISTORY_CAPACITY);
    }

    #[test]
    fn unfinished_batches_are_not_recorded() {
        let metrics = SyncMetrics::new();
        metrics.batch_finished(&finished(BatchStatus::Running, 1));
        assert!(metrics.history().is_empty());
    }
}
