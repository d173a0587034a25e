//! Staged changes and their transition table.

use crate::conflict::Severity;
use crate::error::{CoreError, CoreResult};
use crate::field::FieldDiff;
use crate::types::{BatchId, ChangeId, EntityId, Priority, Timestamp};
use serde::{Deserialize, Serialize};

/// Kind of remote mutation a change performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// First push of an entity to the remote.
    Create,
    /// Field update of an already-synced entity.
    Update,
    /// Removal from the remote.
    Delete,
    /// Field update sent through the remote's bulk endpoint.
    Bulk,
}

impl ChangeType {
    /// Returns the lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
            ChangeType::Bulk => "bulk",
        }
    }
}

/// Lifecycle status of a staged change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Awaiting review.
    Pending,
    /// Approved, waiting to be queued.
    Approved,
    /// Approved but the entity moved underneath it before queueing.
    Blocked,
    /// Rejected by a reviewer.
    Rejected,
    /// Assigned to a batch.
    Queued,
    /// Remote mutation in flight.
    Applying,
    /// Applied remotely and locally.
    Applied,
    /// Gave up; see the change's error message.
    Failed,
    /// Reverted by a batch rollback.
    RolledBack,
}

impl ChangeStatus {
    /// Returns true if the transition `self -> to` is in the table.
    pub fn can_transition_to(self, to: ChangeStatus) -> bool {
        use ChangeStatus::*;
        matches!(
            (self, to),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Queued)
                | (Approved, Blocked)
                | (Queued, Applying)
                | (Queued, Failed)
                | (Applying, Applied)
                | (Applying, Failed)
                | (Applied, RolledBack)
        )
    }

    /// Checks a transition against the table.
    pub fn check_transition(self, to: ChangeStatus) -> CoreResult<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(CoreError::transition(self, to))
        }
    }

    /// Returns true while the change holds its entity's sync lock.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ChangeStatus::Pending
                | ChangeStatus::Approved
                | ChangeStatus::Queued
                | ChangeStatus::Applying
        )
    }

    /// Returns true if no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChangeStatus::Rejected
                | ChangeStatus::Blocked
                | ChangeStatus::Failed
                | ChangeStatus::RolledBack
        )
    }
}

/// A proposed mutation awaiting review and application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedChange {
    /// Change identifier.
    pub id: ChangeId,
    /// Target entity.
    pub entity_id: EntityId,
    /// Kind of remote mutation.
    pub change_type: ChangeType,
    /// Entity version the diff was computed against.
    pub base_version: u64,
    /// Field-level diff.
    pub diff: FieldDiff,
    /// Current status.
    pub status: ChangeStatus,
    /// Scheduling priority.
    pub priority: Priority,
    /// Confidence score in `[0, 100]`.
    pub confidence_score: u8,
    /// Severity of the most recent detected conflict, if any.
    pub conflict_severity: Option<Severity>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Reviewer that approved or rejected the change.
    pub reviewed_by: Option<String>,
    /// Review time.
    pub reviewed_at: Option<Timestamp>,
    /// Batch the change was assigned to.
    pub batch_id: Option<BatchId>,
    /// Explanatory message for blocked or failed changes.
    pub error: Option<String>,
}

impl StagedChange {
    /// Creates a pending change.
    pub fn new(
        entity_id: EntityId,
        change_type: ChangeType,
        base_version: u64,
        diff: FieldDiff,
        priority: Priority,
    ) -> Self {
        Self {
            id: ChangeId::new(),
            entity_id,
            change_type,
            base_version,
            diff,
            status: ChangeStatus::Pending,
            priority,
            confidence_score: 100,
            conflict_severity: None,
            created_at: Timestamp::now(),
            reviewed_by: None,
            reviewed_at: None,
            batch_id: None,
            error: None,
        }
    }

    /// Names of the fields touched by this change.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.diff.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChangeStatus::*;

    const ALL: [ChangeStatus; 9] = [
        Pending, Approved, Blocked, Rejected, Queued, Applying, Applied, Failed, RolledBack,
    ];

    #[test]
    fn table_allows_listed_moves() {
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Queued));
        assert!(Approved.can_transition_to(Blocked));
        assert!(Queued.can_transition_to(Applying));
        assert!(Applying.can_transition_to(Applied));
        assert!(Applying.can_transition_to(Failed));
        assert!(Applied.can_transition_to(RolledBack));
    }

    #[test]
    fn table_rejects_unlisted_moves() {
        assert!(!Pending.can_transition_to(Applied));
        assert!(!Approved.can_transition_to(Pending));
        assert!(!Applied.can_transition_to(Pending));
        assert!(Rejected.check_transition(Approved).is_err());
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn active_and_terminal_are_disjoint() {
        for s in ALL {
            assert!(!(s.is_active() && s.is_terminal()), "{s:?}");
        }
        assert!(!Applied.is_active());
        assert!(!Applied.is_terminal());
    }

    #[test]
    fn new_change_is_pending() {
        let change = StagedChange::new(
            EntityId::new(),
            ChangeType::Update,
            3,
            FieldDiff::new(),
            Priority::Normal,
        );
        assert_eq!(change.status, Pending);
        assert_eq!(change.base_version, 3);
        assert!(change.reviewed_by.is_none());
    }
}
