//! Review gate between staging and scheduling.
//!
//! The pending → approved move is a single compare-and-set in the store,
//! so of two concurrent approvals exactly one wins and only the winner
//! gets to enqueue the change.

use crate::detector::ConflictDetector;
use catsync_core::{
    ChangeId, ChangeStatus, ConflictResolution, CoreError, CoreResult, StagedChange, SyncStore,
    Timestamp,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of a bulk approval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkApprovalReport {
    /// Changes approved, in staging order.
    pub approved: Vec<ChangeId>,
    /// Changes that matched but could not be approved.
    pub skipped: Vec<(ChangeId, String)>,
}

/// Approves and rejects staged changes.
pub struct ApprovalGate<S> {
    store: Arc<S>,
    detector: Arc<ConflictDetector<S>>,
}

impl<S: SyncStore> ApprovalGate<S> {
    /// Creates a gate.
    pub fn new(store: Arc<S>, detector: Arc<ConflictDetector<S>>) -> Self {
        Self { store, detector }
    }

    /// Approves a pending change.
    ///
    /// Fails with `Conflict` while an unresolved conflict exists or when
    /// the entity moved since staging (a conflict is recorded first).
    pub fn approve(&self, change_id: ChangeId, reviewer: &str) -> CoreResult<StagedChange> {
        let change = self.pending(change_id, ChangeStatus::Approved)?;

        let open = self
            .store
            .conflicts_for_change(change_id)
            .into_iter()
            .filter(|c| !c.is_resolved())
            .count();
        if open > 0 {
            return Err(CoreError::conflict(
                change.entity_id,
                format!("{open} unresolved conflict(s) block approval of {change_id}"),
            ));
        }
        if let Some(conflict) = self.detector.check_fresh(&change)? {
            return Err(CoreError::conflict(
                change.entity_id,
                format!(
                    "entity moved from version {} to {} since staging (conflict {})",
                    conflict.base_version, conflict.live_version, conflict.id
                ),
            ));
        }

        let approved = self.store.transition_change(
            change_id,
            ChangeStatus::Pending,
            ChangeStatus::Approved,
            |c| {
                c.reviewed_by = Some(reviewer.to_string());
                c.reviewed_at = Some(Timestamp::now());
            },
        )?;
        info!(change_id = %change_id, reviewer, "change approved");
        Ok(approved)
    }

    /// Rejects a pending change. Terminal; releases the entity lock.
    pub fn reject(&self, change_id: ChangeId, reviewer: &str) -> CoreResult<StagedChange> {
        self.pending(change_id, ChangeStatus::Rejected)?;
        let rejected = self.store.transition_change(
            change_id,
            ChangeStatus::Pending,
            ChangeStatus::Rejected,
            |c| {
                c.reviewed_by = Some(reviewer.to_string());
                c.reviewed_at = Some(Timestamp::now());
            },
        )?;

        for conflict in self.store.conflicts_for_change(change_id) {
            if !conflict.is_resolved() {
                self.store
                    .resolve_conflict(conflict.id, ConflictResolution::DiscardStaged)?;
            }
        }
        self.detector.refresh_conflict_flag(rejected.entity_id)?;
        info!(change_id = %change_id, reviewer, "change rejected");
        Ok(rejected)
    }

    /// Approves every pending change matching `predicate`.
    ///
    /// Never stops early: changes that cannot be approved are reported in
    /// [`BulkApprovalReport::skipped`].
    pub fn bulk_approve<P>(&self, predicate: P, reviewer: &str) -> BulkApprovalReport
    where
        P: Fn(&StagedChange) -> bool,
    {
        let candidates = self
            .store
            .list_changes(&|c| c.status == ChangeStatus::Pending && predicate(c));
        let mut report = BulkApprovalReport::default();
        for change in candidates {
            match self.approve(change.id, reviewer) {
                Ok(_) => report.approved.push(change.id),
                Err(err) => report.skipped.push((change.id, err.to_string())),
            }
        }
        debug!(
            approved = report.approved.len(),
            skipped = report.skipped.len(),
            "bulk approval finished"
        );
        report
    }

    fn pending(&self, change_id: ChangeId, to: ChangeStatus) -> CoreResult<StagedChange> {
        let change = self
            .store
            .get_change(change_id)?
            .ok_or_else(|| CoreError::not_found("staged change", change_id))?;
        if change.status != ChangeStatus::Pending {
            return Err(CoreError::transition(change.status, to));
        }
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApprovalPolicy;
    use crate::stager::{ChangeStager, StageRequest};
    use catsync_core::{field_map, ConflictRules, Entity, EntityId, FieldValue, MemoryStore};
    use catsync_core::{EntityStore, StagingStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        stager: ChangeStager<MemoryStore>,
        gate: Arc<ApprovalGate<MemoryStore>>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let detector = Arc::new(ConflictDetector::new(
            Arc::clone(&store),
            ConflictRules::default(),
            ApprovalPolicy::default(),
        ));
        Fixture {
            stager: ChangeStager::new(Arc::clone(&store), ConflictRules::default()),
            gate: Arc::new(ApprovalGate::new(Arc::clone(&store), detector)),
            store,
        }
    }

    fn staged_entity(f: &Fixture, price: f64) -> (EntityId, ChangeId) {
        let entity = Entity::new(EntityId::new(), field_map([("price", FieldValue::Float(10.0))]))
            .with_external_id(format!("gid://{}", EntityId::new()))
            .with_version(3);
        let id = entity.id;
        f.store.insert_entity(entity).unwrap();
        let change = f
            .stager
            .stage(&StageRequest::update(id, field_map([("price", price)])))
            .unwrap()
            .unwrap();
        (id, change.id)
    }

    #[test]
    fn approve_records_reviewer() {
        let f = fixture();
        let (_, change_id) = staged_entity(&f, 12.0);
        let change = f.gate.approve(change_id, "ana").unwrap();
        assert_eq!(change.status, ChangeStatus::Approved);
        assert_eq!(change.reviewed_by.as_deref(), Some("ana"));
        assert!(change.reviewed_at.is_some());

        assert!(matches!(
            f.gate.approve(change_id, "ana"),
            Err(CoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn concurrent_approvals_have_one_winner() {
        let f = fixture();
        let (_, change_id) = staged_entity(&f, 12.0);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let gate = Arc::clone(&f.gate);
                std::thread::spawn(move || {
                    gate.approve(change_id, &format!("reviewer-{i}")).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn stale_change_cannot_be_approved() {
        let f = fixture();
        let (entity_id, change_id) = staged_entity(&f, 12.0);

        let mut entity = f.store.get_entity(entity_id).unwrap().unwrap();
        entity.version = 4;
        entity.fields.insert("price".into(), FieldValue::Float(11.0));
        f.store.put_entity(entity, 3).unwrap();

        let err = f.gate.approve(change_id, "ana").unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
        assert_eq!(f.store.conflicts_for_change(change_id).len(), 1);

        // The recorded conflict keeps blocking.
        assert!(matches!(
            f.gate.approve(change_id, "ana"),
            Err(CoreError::Conflict { .. })
        ));
    }

    #[test]
    fn reject_is_terminal_and_unlocks() {
        let f = fixture();
        let (entity_id, change_id) = staged_entity(&f, 12.0);
        let change = f.gate.reject(change_id, "bo").unwrap();
        assert_eq!(change.status, ChangeStatus::Rejected);
        assert!(!f.store.get_entity(entity_id).unwrap().unwrap().sync_locked);
        assert!(f.gate.approve(change_id, "bo").is_err());
    }

    #[test]
    fn bulk_approve_reports_skips() {
        let f = fixture();
        let (_, cheap) = staged_entity(&f, 5.0);
        let (_, pricey) = staged_entity(&f, 50.0);
        let (stale_entity, stale) = staged_entity(&f, 20.0);

        let mut entity = f.store.get_entity(stale_entity).unwrap().unwrap();
        entity.version = 4;
        f.store.put_entity(entity, 3).unwrap();

        let report = f.gate.bulk_approve(
            |c| {
                c.diff["price"]
                    .after
                    .as_ref()
                    .and_then(FieldValue::as_f64)
                    .is_some_and(|p| p < 30.0)
            },
            "ops",
        );
        assert_eq!(report.approved, vec![cheap]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, stale);
        assert_eq!(
            f.store.get_change(pricey).unwrap().unwrap().status,
            ChangeStatus::Pending
        );
    }
}
