//! Sync batches and their transition table.

use crate::change::ChangeType;
use crate::error::{CoreError, CoreResult};
use crate::types::{BatchId, ChangeId, Priority, Timestamp};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Formed, waiting for a worker.
    Pending,
    /// A worker is processing it.
    Running,
    /// Every item reached a terminal state.
    Completed,
    /// Cancelled or out of attempts.
    Failed,
    /// Reverted after completion.
    RolledBack,
}

impl BatchStatus {
    /// Returns true if the transition `self -> to` is in the table.
    ///
    /// `Running -> Pending` is the requeue edge used after a worker crash
    /// or timeout; `Pending -> Failed` covers cancellation before start.
    pub fn can_transition_to(self, to: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Pending)
                | (Running, Completed)
                | (Running, Failed)
                | (Completed, RolledBack)
        )
    }

    /// Checks a transition against the table.
    pub fn check_transition(self, to: BatchStatus) -> CoreResult<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(CoreError::transition(self, to))
        }
    }

    /// Returns true once processing has finished one way or another.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::RolledBack
        )
    }
}

/// Item outcome counters for a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Items applied.
    pub succeeded: u32,
    /// Items failed.
    pub failed: u32,
    /// Items skipped (already terminal when the batch reached them).
    pub skipped: u32,
}

impl BatchStats {
    /// Total items accounted for.
    pub fn total(&self) -> u32 {
        self.succeeded + self.failed + self.skipped
    }
}

/// A bounded, ordered group of approved changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    /// Batch identifier.
    pub id: BatchId,
    /// Current status.
    pub status: BatchStatus,
    /// Priority the batch was scheduled at.
    pub priority: Priority,
    /// Shared change type of every item.
    pub change_type: ChangeType,
    /// Items in processing order.
    pub item_ids: Vec<ChangeId>,
    /// Outcome counters.
    pub stats: BatchStats,
    /// Number of times a worker picked the batch up.
    pub attempts: u32,
    /// Formation time.
    pub created_at: Timestamp,
    /// First start time.
    pub started_at: Option<Timestamp>,
    /// Finish time.
    pub completed_at: Option<Timestamp>,
    /// Reason for failure, if failed.
    pub error: Option<String>,
}

impl SyncBatch {
    /// Creates a pending batch.
    pub fn new(priority: Priority, change_type: ChangeType, item_ids: Vec<ChangeId>) -> Self {
        Self {
            id: BatchId::new(),
            status: BatchStatus::Pending,
            priority,
            change_type,
            item_ids,
            stats: BatchStats::default(),
            attempts: 0,
            created_at: Timestamp::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// Returns true if the batch has no items.
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }

    /// Processing duration in milliseconds, once finished.
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end.as_millis().saturating_sub(start.as_millis())),
            _ => None,
        }
    }
}
