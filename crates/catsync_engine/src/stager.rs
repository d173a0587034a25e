//! Change staging: candidate state in, pending staged change out.

use crate::detector::confidence_score;
use catsync_core::{
    apply_diff, diff_fields, removal_diff, validate_fields, visible_fields, ChangeType,
    ConflictRules, CoreError, CoreResult, Entity, EntityId, FieldDiff, FieldMap, Priority,
    StagedChange, SyncStore,
};
use std::sync::Arc;
use tracing::{debug, info};

/// What a producer wants an entity to look like.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRequest {
    /// Target entity.
    pub entity_id: EntityId,
    /// Partial candidate state. `Null` removes a field.
    pub candidate: FieldMap,
    /// Remove the entity from the remote.
    pub delete: bool,
    /// Route the update through the remote's bulk endpoint.
    pub bulk: bool,
    /// Scheduling priority.
    pub priority: Priority,
}

impl StageRequest {
    /// Proposes new field values.
    pub fn update(entity_id: EntityId, candidate: FieldMap) -> Self {
        Self {
            entity_id,
            candidate,
            delete: false,
            bulk: false,
            priority: Priority::Normal,
        }
    }

    /// Proposes removing the entity remotely.
    pub fn delete(entity_id: EntityId) -> Self {
        Self {
            delete: true,
            ..Self::update(entity_id, FieldMap::new())
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sends the update through the bulk endpoint.
    #[must_use]
    pub fn via_bulk(mut self) -> Self {
        self.bulk = true;
        self
    }
}

/// Diffs candidates against entities and creates pending changes.
pub struct ChangeStager<S> {
    store: Arc<S>,
    rules: ConflictRules,
}

impl<S: SyncStore> ChangeStager<S> {
    /// Creates a stager.
    pub fn new(store: Arc<S>, rules: ConflictRules) -> Self {
        Self { store, rules }
    }

    /// Stages a request.
    ///
    /// Returns `Ok(None)` when the candidate changes no visible field. On
    /// success the entity is locked until the change leaves its active
    /// states. Fails with `NotFound`, `Validation`, or `Conflict` when the
    /// entity already has an active change (first writer wins, whatever
    /// the priorities).
    pub fn stage(&self, request: &StageRequest) -> CoreResult<Option<StagedChange>> {
        validate_fields(&request.candidate)?;
        if request.delete && !request.candidate.is_empty() {
            return Err(CoreError::Validation(
                "delete requests must not carry fields".into(),
            ));
        }
        if request.delete && request.bulk {
            return Err(CoreError::Validation(
                "deletes cannot go through the bulk endpoint".into(),
            ));
        }

        let entity = self
            .store
            .get_entity(request.entity_id)?
            .ok_or_else(|| CoreError::not_found("entity", request.entity_id))?;
        if self.plan(&entity, request)?.is_none() {
            debug!(entity_id = %request.entity_id, "candidate matches entity; nothing staged");
            return Ok(None);
        }

        let locked = self.store.lock_entity(request.entity_id)?;
        // The entity may have moved between the read and the lock.
        let staged = self.plan(&locked, request).and_then(|plan| match plan {
            Some((change_type, diff)) => {
                let mut change = StagedChange::new(
                    locked.id,
                    change_type,
                    locked.version,
                    diff,
                    request.priority,
                );
                change.confidence_score = confidence_score(&change.diff, &self.rules, false);
                self.store.insert_change(change.clone())?;
                Ok(Some(change))
            }
            None => Ok(None),
        });

        match &staged {
            Ok(Some(change)) => info!(
                change_id = %change.id,
                entity_id = %change.entity_id,
                change_type = change.change_type.as_str(),
                priority = %change.priority,
                fields = change.diff.len(),
                "change staged"
            ),
            _ => self.store.unlock_entity(request.entity_id)?,
        }
        staged
    }

    /// Decides the change type and diff, `None` for a no-op.
    fn plan(
        &self,
        entity: &Entity,
        request: &StageRequest,
    ) -> CoreResult<Option<(ChangeType, FieldDiff)>> {
        if request.delete {
            if !entity.is_synced() {
                return Err(CoreError::Validation(format!(
                    "entity {} was never synced; nothing to delete",
                    entity.id
                )));
            }
            return Ok(Some((ChangeType::Delete, removal_diff(&entity.fields))));
        }

        if !entity.is_synced() {
            if request.bulk {
                return Err(CoreError::Validation(format!(
                    "entity {} must be created before bulk updates",
                    entity.id
                )));
            }
            // A create pushes the whole visible record.
            let mut merged = entity.fields.clone();
            apply_diff(&mut merged, &diff_fields(&entity.fields, &request.candidate));
            let diff = diff_fields(&FieldMap::new(), &visible_fields(&merged));
            return Ok((!diff.is_empty()).then_some((ChangeType::Create, diff)));
        }

        let diff = diff_fields(&entity.fields, &request.candidate);
        let change_type = if request.bulk {
            ChangeType::Bulk
        } else {
            ChangeType::Update
        };
        Ok((!diff.is_empty()).then_some((change_type, diff)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catsync_core::{field_map, ChangeStatus, FieldValue, MemoryStore, StagingStore};
    use catsync_core::EntityStore;

    fn setup(synced: bool) -> (Arc<MemoryStore>, ChangeStager<MemoryStore>, EntityId) {
        let store = Arc::new(MemoryStore::new());
        let mut entity = Entity::new(
            EntityId::new(),
            field_map([("price", FieldValue::Float(10.0)), ("title", "Mug".into())]),
        );
        if synced {
            entity = entity.with_external_id("gid://1").with_version(3);
        }
        let id = entity.id;
        store.insert_entity(entity).unwrap();
        let stager = ChangeStager::new(Arc::clone(&store), ConflictRules::default());
        (store, stager, id)
    }

    #[test]
    fn stages_update_and_locks_entity() {
        let (store, stager, id) = setup(true);
        let change = stager
            .stage(&StageRequest::update(id, field_map([("price", 12.0)])))
            .unwrap()
            .unwrap();

        assert_eq!(change.status, ChangeStatus::Pending);
        assert_eq!(change.change_type, ChangeType::Update);
        assert_eq!(change.base_version, 3);
        assert_eq!(change.diff.len(), 1);
        assert!(store.get_entity(id).unwrap().unwrap().sync_locked);
    }

    #[test]
    fn noop_candidate_stages_nothing() {
        let (store, stager, id) = setup(true);
        let request = StageRequest::update(id, field_map([("price", 10.0)]));
        assert!(stager.stage(&request).unwrap().is_none());
        assert!(stager.stage(&request).unwrap().is_none());
        assert!(store.list_changes(&|_| true).is_empty());
        assert!(!store.get_entity(id).unwrap().unwrap().sync_locked);
    }

    #[test]
    fn second_writer_conflicts_regardless_of_priority() {
        let (_, stager, id) = setup(true);
        let low =
            StageRequest::update(id, field_map([("price", 12.0)])).with_priority(Priority::Low);
        stager.stage(&low).unwrap();

        let err = stager
            .stage(
                &StageRequest::update(id, field_map([("price", 15.0)]))
                    .with_priority(Priority::Critical),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
    }

    #[test]
    fn unknown_entity_and_bad_candidate() {
        let (_, stager, _) = setup(true);
        let err = stager
            .stage(&StageRequest::update(EntityId::new(), field_map([("price", 1.0)])))
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));

        let (_, stager, id) = setup(true);
        let err = stager
            .stage(&StageRequest::update(id, field_map([("price", f64::INFINITY)])))
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn unsynced_entity_stages_full_create() {
        let (_, stager, id) = setup(false);
        let change = stager
            .stage(&StageRequest::update(id, field_map([("sku", "MUG-1")])))
            .unwrap()
            .unwrap();

        assert_eq!(change.change_type, ChangeType::Create);
        assert_eq!(
            change.field_names().collect::<Vec<_>>(),
            vec!["price", "sku", "title"]
        );
        assert!(change.diff.values().all(|c| c.before.is_none()));
    }

    #[test]
    fn delete_rules() {
        let (_, stager, id) = setup(false);
        assert!(matches!(
            stager.stage(&StageRequest::delete(id)),
            Err(CoreError::Validation(_))
        ));

        let (store, stager, id) = setup(true);
        let change = stager.stage(&StageRequest::delete(id)).unwrap().unwrap();
        assert_eq!(change.change_type, ChangeType::Delete);
        assert!(change.diff.values().all(|c| c.after.is_none()));
        assert!(store.get_entity(id).unwrap().unwrap().sync_locked);
    }

    #[test]
    fn bulk_flag_selects_bulk_type() {
        let (_, stager, id) = setup(true);
        let change = stager
            .stage(&StageRequest::update(id, field_map([("title", "Cup")])).via_bulk())
            .unwrap()
            .unwrap();
        assert_eq!(change.change_type, ChangeType::Bulk);
    }
}
