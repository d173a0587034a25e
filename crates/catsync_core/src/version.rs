//! Sync versions: pre-change snapshots kept for rollback.

use crate::change::ChangeType;
use crate::entity::EntitySnapshot;
use crate::types::{BatchId, ChangeId, EntityId, Timestamp, VersionId};
use serde::{Deserialize, Serialize};

/// Before-image of one applied item.
///
/// Exactly one row exists per applied change. It is written in the same
/// store commit that marks the change applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncVersion {
    /// Row identifier.
    pub id: VersionId,
    /// The entity the snapshot belongs to.
    pub entity_id: EntityId,
    /// The batch that applied the change.
    pub batch_id: BatchId,
    /// The applied change.
    pub change_id: ChangeId,
    /// Kind of mutation that was applied.
    pub change_type: ChangeType,
    /// Entity state right before the change.
    pub snapshot: EntitySnapshot,
    /// Entity version right after the change.
    pub applied_version: u64,
    /// Digest of the field map sent to the remote.
    pub applied_digest: [u8; 32],
    /// Creation time.
    pub created_at: Timestamp,
}

impl SyncVersion {
    /// Creates a version row.
    pub fn new(
        entity_id: EntityId,
        batch_id: BatchId,
        change_id: ChangeId,
        change_type: ChangeType,
        snapshot: EntitySnapshot,
        applied_version: u64,
        applied_digest: [u8; 32],
    ) -> Self {
        Self {
            id: VersionId::new(),
            entity_id,
            batch_id,
            change_id,
            change_type,
            snapshot,
            applied_version,
            applied_digest,
            created_at: Timestamp::now(),
        }
    }
}
