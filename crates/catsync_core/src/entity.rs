//! Catalog entities and their snapshots.

use crate::error::{CoreError, CoreResult};
use crate::field::FieldMap;
use crate::types::EntityId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A local catalog entity mirrored to the remote platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Local identifier.
    pub id: EntityId,
    /// Remote identifier, `None` until the first successful create.
    pub external_id: Option<String>,
    /// Monotonic local version. Bumped by exactly one per applied change.
    pub version: u64,
    /// Version last pushed to the remote.
    pub last_sync_version: u64,
    /// Set while a staged change for this entity is active.
    pub sync_locked: bool,
    /// Field values.
    pub fields: FieldMap,
    /// Set while unresolved conflict records exist.
    pub has_conflicts: bool,
}

impl Entity {
    /// Creates a never-synced entity at version 1.
    pub fn new(id: EntityId, fields: FieldMap) -> Self {
        Self {
            id,
            external_id: None,
            version: 1,
            last_sync_version: 0,
            sync_locked: false,
            fields,
            has_conflicts: false,
        }
    }

    /// Sets the remote identifier.
    #[must_use]
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    /// Sets the version (and marks it synced).
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self.last_sync_version = version;
        self
    }

    /// Returns true if the entity has been created remotely.
    pub fn is_synced(&self) -> bool {
        self.external_id.is_some()
    }

    /// Captures the restorable state of this entity.
    pub fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            external_id: self.external_id.clone(),
            version: self.version,
            last_sync_version: self.last_sync_version,
            fields: self.fields.clone(),
            has_conflicts: self.has_conflicts,
        }
    }

    /// Restores a snapshot. The lock flag is always cleared.
    pub fn restore(&mut self, snapshot: &EntitySnapshot) {
        self.external_id = snapshot.external_id.clone();
        self.version = snapshot.version;
        self.last_sync_version = snapshot.last_sync_version;
        self.fields = snapshot.fields.clone();
        self.has_conflicts = snapshot.has_conflicts;
        self.sync_locked = false;
    }
}

/// The restorable part of an entity, as stored in a sync version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Remote identifier at snapshot time.
    pub external_id: Option<String>,
    /// Version at snapshot time.
    pub version: u64,
    /// Last synced version at snapshot time.
    pub last_sync_version: u64,
    /// Field values at snapshot time.
    pub fields: FieldMap,
    /// Conflict flag at snapshot time.
    pub has_conflicts: bool,
}

impl EntitySnapshot {
    /// Encodes the snapshot as canonical CBOR.
    ///
    /// Field maps are ordered, so equal snapshots always produce equal
    /// bytes.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| CoreError::Codec(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes a snapshot from CBOR.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::Codec(e.to_string()))
    }
}

/// SHA-256 digest of a field map's canonical CBOR encoding.
pub fn fields_digest(fields: &FieldMap) -> CoreResult<[u8; 32]> {
    let mut buf = Vec::new();
    ciborium::into_writer(fields, &mut buf).map_err(|e| CoreError::Codec(e.to_string()))?;
    Ok(Sha256::digest(&buf).into())
}
