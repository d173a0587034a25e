//! # catsync core
//!
//! Data model and stores for the catsync staged synchronization engine.
//!
//! This crate provides:
//! - Entities, staged changes, conflicts, batches and sync versions
//! - Explicit status transition tables for changes and batches
//! - Field-level diffing and divergence scoring primitives
//! - The declarative conflict rule table
//! - Canonical snapshot encoding and field digests
//! - Store traits and an in-memory store with compare-and-set writes
//!
//! This crate performs no I/O and has no async runtime dependency.
//!
//! ## Key Invariants
//!
//! - At most one active staged change per entity (enforced by `sync_locked`)
//! - Statuses only move along their transition tables
//! - Entity versions grow by one per applied change and only go back
//!   through a rollback that restores a sync version
//! - Every applied change has exactly one sync version row

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod change;
mod conflict;
mod entity;
mod error;
mod field;
mod store;
mod types;
mod version;

pub use batch::{BatchStats, BatchStatus, SyncBatch};
pub use change::{ChangeStatus, ChangeType, StagedChange};
pub use conflict::{Conflict, ConflictResolution, ConflictRules, FieldRule, Severity};
pub use entity::{fields_digest, Entity, EntitySnapshot};
pub use error::{CoreError, CoreResult};
pub use field::{
    apply_diff, diff_fields, field_map, is_visible, removal_diff, validate_fields, visible_fields,
    FieldChange, FieldDiff, FieldMap, FieldValue, MAX_FIELD_NAME_LEN, MAX_TEXT_LEN,
};
pub use store::{ApplyCommit, EntityStore, MemoryStore, RollbackCommit, StagingStore, SyncStore};
pub use types::{BatchId, ChangeId, ConflictId, EntityId, Priority, Timestamp, VersionId};
pub use version::SyncVersion;
