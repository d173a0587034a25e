//! Store traits and the in-memory store.
//!
//! The entity side ([`EntityStore`]) is the local catalog collaborator:
//! get/put by id with optimistic version checks. The staging side
//! ([`StagingStore`]) owns staged changes, conflicts, batches and sync
//! versions. Every status write is a compare-and-set against the status the
//! caller observed, so concurrent workers never lose updates.
//!
//! # Lock order
//!
//! [`MemoryStore`] keeps one lock per table. Operations spanning tables
//! acquire them in the order entities, changes, conflicts, batches,
//! versions.

use crate::batch::{BatchStatus, SyncBatch};
use crate::change::{ChangeStatus, StagedChange};
use crate::conflict::{Conflict, ConflictResolution};
use crate::entity::{Entity, EntitySnapshot};
use crate::error::{CoreError, CoreResult};
use crate::types::{BatchId, ChangeId, ConflictId, EntityId};
use crate::version::SyncVersion;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::trace;

/// Local catalog store.
pub trait EntityStore: Send + Sync {
    /// Reads an entity.
    fn get_entity(&self, id: EntityId) -> CoreResult<Option<Entity>>;

    /// Inserts or replaces an entity unconditionally (producer side).
    fn insert_entity(&self, entity: Entity) -> CoreResult<()>;

    /// Replaces an entity if the stored version equals `expected_version`.
    fn put_entity(&self, entity: Entity, expected_version: u64) -> CoreResult<()>;

    /// Atomically sets `sync_locked` if it is clear and returns the entity.
    ///
    /// Fails with [`CoreError::Conflict`] if the entity is already locked.
    fn lock_entity(&self, id: EntityId) -> CoreResult<Entity>;

    /// Clears `sync_locked`.
    fn unlock_entity(&self, id: EntityId) -> CoreResult<()>;

    /// Sets or clears the conflict flag.
    fn set_has_conflicts(&self, id: EntityId, has_conflicts: bool) -> CoreResult<()>;

    /// Lists every entity id.
    fn entity_ids(&self) -> Vec<EntityId>;
}

/// Everything the apply engine writes after a successful remote call.
#[derive(Debug, Clone)]
pub struct ApplyCommit {
    /// The applied change (must be `Applying`).
    pub change_id: ChangeId,
    /// New entity state.
    pub entity: Entity,
    /// Entity version observed when the snapshot was taken.
    pub expected_version: u64,
    /// The before-image row.
    pub version: SyncVersion,
}

/// Everything a rollback writes for one item.
#[derive(Debug, Clone)]
pub struct RollbackCommit {
    /// The change being reverted (must be `Applied`).
    pub change_id: ChangeId,
    /// The entity being restored.
    pub entity_id: EntityId,
    /// Version the entity must still be at.
    pub expected_version: u64,
    /// State to restore.
    pub snapshot: EntitySnapshot,
    /// Remote id to adopt instead of the snapshot's (delete compensation).
    pub external_id_override: Option<String>,
}

/// Store for staged changes, conflicts, batches and sync versions.
pub trait StagingStore: Send + Sync {
    /// Inserts a new staged change.
    fn insert_change(&self, change: StagedChange) -> CoreResult<()>;

    /// Reads a staged change.
    fn get_change(&self, id: ChangeId) -> CoreResult<Option<StagedChange>>;

    /// Lists staged changes matching a predicate.
    fn list_changes(&self, filter: &dyn Fn(&StagedChange) -> bool) -> Vec<StagedChange>;

    /// Moves a change from `from` to `to` if its status is still `from`.
    ///
    /// `update` runs inside the same critical section. Leaving an active
    /// status releases the entity's sync lock.
    fn transition_change<F>(
        &self,
        id: ChangeId,
        from: ChangeStatus,
        to: ChangeStatus,
        update: F,
    ) -> CoreResult<StagedChange>
    where
        F: FnOnce(&mut StagedChange);

    /// Updates a change in place if its status is still `expected`.
    fn update_change<F>(
        &self,
        id: ChangeId,
        expected: ChangeStatus,
        update: F,
    ) -> CoreResult<StagedChange>
    where
        F: FnOnce(&mut StagedChange);

    /// Inserts a conflict record.
    fn insert_conflict(&self, conflict: Conflict) -> CoreResult<()>;

    /// Reads a conflict record.
    fn get_conflict(&self, id: ConflictId) -> CoreResult<Option<Conflict>>;

    /// Lists conflicts recorded for a change.
    fn conflicts_for_change(&self, change_id: ChangeId) -> Vec<Conflict>;

    /// Lists unresolved conflicts for an entity.
    fn unresolved_conflicts_for_entity(&self, entity_id: EntityId) -> Vec<Conflict>;

    /// Resolves an unresolved conflict.
    fn resolve_conflict(
        &self,
        id: ConflictId,
        resolution: ConflictResolution,
    ) -> CoreResult<Conflict>;

    /// Inserts a new batch.
    fn insert_batch(&self, batch: SyncBatch) -> CoreResult<()>;

    /// Reads a batch.
    fn get_batch(&self, id: BatchId) -> CoreResult<Option<SyncBatch>>;

    /// Lists batches matching a predicate.
    fn list_batches(&self, filter: &dyn Fn(&SyncBatch) -> bool) -> Vec<SyncBatch>;

    /// Moves a batch from `from` to `to` if its status is still `from`.
    fn transition_batch<F>(
        &self,
        id: BatchId,
        from: BatchStatus,
        to: BatchStatus,
        update: F,
    ) -> CoreResult<SyncBatch>
    where
        F: FnOnce(&mut SyncBatch);

    /// Updates a batch in place if its status is still `expected`.
    fn update_batch<F>(
        &self,
        id: BatchId,
        expected: BatchStatus,
        update: F,
    ) -> CoreResult<SyncBatch>
    where
        F: FnOnce(&mut SyncBatch);

    /// Atomically records a successful apply.
    fn commit_apply(&self, commit: ApplyCommit) -> CoreResult<()>;

    /// Atomically restores an entity from its sync version.
    fn commit_rollback(&self, commit: RollbackCommit) -> CoreResult<Entity>;

    /// Reads the sync version written for a change.
    fn version_for_change(&self, change_id: ChangeId) -> Option<SyncVersion>;

    /// Lists the sync versions written by a batch.
    fn versions_for_batch(&self, batch_id: BatchId) -> Vec<SyncVersion>;
}

/// Both halves of the store.
pub trait SyncStore: EntityStore + StagingStore + 'static {}

impl<T: EntityStore + StagingStore + 'static> SyncStore for T {}

/// An in-memory store for tests, demos and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: RwLock<HashMap<EntityId, Entity>>,
    changes: RwLock<HashMap<ChangeId, StagedChange>>,
    conflicts: RwLock<HashMap<ConflictId, Conflict>>,
    batches: RwLock<HashMap<BatchId, SyncBatch>>,
    versions: RwLock<HashMap<ChangeId, SyncVersion>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sync version rows.
    pub fn version_count(&self) -> usize {
        self.versions.read().len()
    }

    fn check_change_status(change: &StagedChange, expected: ChangeStatus) -> CoreResult<()> {
        if change.status == expected {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                from: format!("{:?}", change.status),
                to: format!("{expected:?} (expected)"),
            })
        }
    }
}

impl EntityStore for MemoryStore {
    fn get_entity(&self, id: EntityId) -> CoreResult<Option<Entity>> {
        Ok(self.entities.read().get(&id).cloned())
    }

    fn insert_entity(&self, entity: Entity) -> CoreResult<()> {
        self.entities.write().insert(entity.id, entity);
        Ok(())
    }

    fn put_entity(&self, entity: Entity, expected_version: u64) -> CoreResult<()> {
        let mut entities = self.entities.write();
        let current = entities
            .get(&entity.id)
            .ok_or_else(|| CoreError::not_found("entity", entity.id))?;
        if current.version != expected_version {
            return Err(CoreError::VersionMismatch {
                entity_id: entity.id,
                expected: expected_version,
                actual: current.version,
            });
        }
        entities.insert(entity.id, entity);
        Ok(())
    }

    fn lock_entity(&self, id: EntityId) -> CoreResult<Entity> {
        let mut entities = self.entities.write();
        let entity = entities
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("entity", id))?;
        if entity.sync_locked {
            return Err(CoreError::conflict(id, "entity already has an active staged change"));
        }
        entity.sync_locked = true;
        Ok(entity.clone())
    }

    fn unlock_entity(&self, id: EntityId) -> CoreResult<()> {
        let mut entities = self.entities.write();
        let entity = entities
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("entity", id))?;
        entity.sync_locked = false;
        Ok(())
    }

    fn set_has_conflicts(&self, id: EntityId, has_conflicts: bool) -> CoreResult<()> {
        let mut entities = self.entities.write();
        let entity = entities
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("entity", id))?;
        entity.has_conflicts = has_conflicts;
        Ok(())
    }

    fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.read().keys().copied().collect()
    }
}

impl StagingStore for MemoryStore {
    fn insert_change(&self, change: StagedChange) -> CoreResult<()> {
        let mut changes = self.changes.write();
        if changes.contains_key(&change.id) {
            return Err(CoreError::Validation(format!(
                "staged change {} already exists",
                change.id
            )));
        }
        changes.insert(change.id, change);
        Ok(())
    }

    fn get_change(&self, id: ChangeId) -> CoreResult<Option<StagedChange>> {
        Ok(self.changes.read().get(&id).cloned())
    }

    fn list_changes(&self, filter: &dyn Fn(&StagedChange) -> bool) -> Vec<StagedChange> {
        let mut out: Vec<_> = self
            .changes
            .read()
            .values()
            .filter(|c| filter(c))
            .cloned()
            .collect();
        out.sort_by_key(|c| (c.created_at, c.id));
        out
    }

    fn transition_change<F>(
        &self,
        id: ChangeId,
        from: ChangeStatus,
        to: ChangeStatus,
        update: F,
    ) -> CoreResult<StagedChange>
    where
        F: FnOnce(&mut StagedChange),
    {
        from.check_transition(to)?;

        let mut entities = self.entities.write();
        let mut changes = self.changes.write();
        let change = changes
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("staged change", id))?;
        if change.status != from {
            return Err(CoreError::transition(change.status, to));
        }

        update(change);
        change.status = to;
        trace!(change_id = %id, ?from, ?to, "staged change transition");

        if from.is_active() && !to.is_active() {
            if let Some(entity) = entities.get_mut(&change.entity_id) {
                entity.sync_locked = false;
            }
        }
        Ok(change.clone())
    }

    fn update_change<F>(
        &self,
        id: ChangeId,
        expected: ChangeStatus,
        update: F,
    ) -> CoreResult<StagedChange>
    where
        F: FnOnce(&mut StagedChange),
    {
        let mut changes = self.changes.write();
        let change = changes
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("staged change", id))?;
        Self::check_change_status(change, expected)?;

        update(change);
        // Status is owned by transition_change.
        change.status = expected;
        Ok(change.clone())
    }

    fn insert_conflict(&self, conflict: Conflict) -> CoreResult<()> {
        self.conflicts.write().insert(conflict.id, conflict);
        Ok(())
    }

    fn get_conflict(&self, id: ConflictId) -> CoreResult<Option<Conflict>> {
        Ok(self.conflicts.read().get(&id).cloned())
    }

    fn conflicts_for_change(&self, change_id: ChangeId) -> Vec<Conflict> {
        let mut out: Vec<_> = self
            .conflicts
            .read()
            .values()
            .filter(|c| c.staged_change_id == change_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.detected_at);
        out
    }

    fn unresolved_conflicts_for_entity(&self, entity_id: EntityId) -> Vec<Conflict> {
        self.conflicts
            .read()
            .values()
            .filter(|c| c.entity_id == entity_id && !c.is_resolved())
            .cloned()
            .collect()
    }

    fn resolve_conflict(
        &self,
        id: ConflictId,
        resolution: ConflictResolution,
    ) -> CoreResult<Conflict> {
        let mut conflicts = self.conflicts.write();
        let conflict = conflicts
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("conflict", id))?;
        if let Some(existing) = conflict.resolution {
            return Err(CoreError::InvalidTransition {
                from: format!("resolved ({existing:?})"),
                to: format!("{resolution:?}"),
            });
        }
        conflict.resolution = Some(resolution);
        Ok(conflict.clone())
    }

    fn insert_batch(&self, batch: SyncBatch) -> CoreResult<()> {
        self.batches.write().insert(batch.id, batch);
        Ok(())
    }

    fn get_batch(&self, id: BatchId) -> CoreResult<Option<SyncBatch>> {
        Ok(self.batches.read().get(&id).cloned())
    }

    fn list_batches(&self, filter: &dyn Fn(&SyncBatch) -> bool) -> Vec<SyncBatch> {
        let mut out: Vec<_> = self
            .batches
            .read()
            .values()
            .filter(|b| filter(b))
            .cloned()
            .collect();
        out.sort_by_key(|b| (b.created_at, b.id));
        out
    }

    fn transition_batch<F>(
        &self,
        id: BatchId,
        from: BatchStatus,
        to: BatchStatus,
        update: F,
    ) -> CoreResult<SyncBatch>
    where
        F: FnOnce(&mut SyncBatch),
    {
        from.check_transition(to)?;

        let mut batches = self.batches.write();
        let batch = batches
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("batch", id))?;
        if batch.status != from {
            return Err(CoreError::transition(batch.status, to));
        }
        update(batch);
        batch.status = to;
        trace!(batch_id = %id, ?from, ?to, "batch transition");
        Ok(batch.clone())
    }

    fn update_batch<F>(
        &self,
        id: BatchId,
        expected: BatchStatus,
        update: F,
    ) -> CoreResult<SyncBatch>
    where
        F: FnOnce(&mut SyncBatch),
    {
        let mut batches = self.batches.write();
        let batch = batches
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("batch", id))?;
        if batch.status != expected {
            return Err(CoreError::transition(batch.status, expected));
        }
        update(batch);
        batch.status = expected;
        Ok(batch.clone())
    }

    fn commit_apply(&self, commit: ApplyCommit) -> CoreResult<()> {
        let mut entities = self.entities.write();
        let mut changes = self.changes.write();
        let mut versions = self.versions.write();

        let change = changes
            .get_mut(&commit.change_id)
            .ok_or_else(|| CoreError::not_found("staged change", commit.change_id))?;
        ChangeStatus::Applying.check_transition(ChangeStatus::Applied)?;
        Self::check_change_status(change, ChangeStatus::Applying)?;

        let current = entities
            .get(&commit.entity.id)
            .ok_or_else(|| CoreError::not_found("entity", commit.entity.id))?;
        if current.version != commit.expected_version {
            return Err(CoreError::VersionMismatch {
                entity_id: commit.entity.id,
                expected: commit.expected_version,
                actual: current.version,
            });
        }
        if versions.contains_key(&commit.change_id) {
            return Err(CoreError::Validation(format!(
                "sync version for {} already recorded",
                commit.change_id
            )));
        }

        change.status = ChangeStatus::Applied;
        change.error = None;
        entities.insert(commit.entity.id, commit.entity);
        versions.insert(commit.change_id, commit.version);
        Ok(())
    }

    fn commit_rollback(&self, commit: RollbackCommit) -> CoreResult<Entity> {
        let mut entities = self.entities.write();
        let mut changes = self.changes.write();

        let change = changes
            .get_mut(&commit.change_id)
            .ok_or_else(|| CoreError::not_found("staged change", commit.change_id))?;
        change.status.check_transition(ChangeStatus::RolledBack)?;

        let entity = entities
            .get_mut(&commit.entity_id)
            .ok_or_else(|| CoreError::not_found("entity", commit.entity_id))?;
        if entity.sync_locked {
            return Err(CoreError::conflict(
                commit.entity_id,
                "entity has an active staged change",
            ));
        }
        if entity.version != commit.expected_version {
            return Err(CoreError::VersionMismatch {
                entity_id: commit.entity_id,
                expected: commit.expected_version,
                actual: entity.version,
            });
        }

        entity.restore(&commit.snapshot);
        if let Some(external_id) = commit.external_id_override {
            entity.external_id = Some(external_id);
        }
        change.status = ChangeStatus::RolledBack;
        Ok(entity.clone())
    }

    fn version_for_change(&self, change_id: ChangeId) -> Option<SyncVersion> {
        self.versions.read().get(&change_id).cloned()
    }

    fn versions_for_batch(&self, batch_id: BatchId) -> Vec<SyncVersion> {
        let mut out: Vec<_> = self
            .versions
            .read()
            .values()
            .filter(|v| v.batch_id == batch_id)
            .cloned()
            .collect();
        out.sort_by_key(|v| (v.created_at, v.id));
        out
    }
}
