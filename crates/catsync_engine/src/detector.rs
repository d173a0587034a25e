//! Conflict detection, confidence scoring and rebasing.
//!
//! A staged change conflicts with the live entity when the version it was
//! computed against is no longer the live version. Severity and confidence
//! come from the declarative [`ConflictRules`] table, so the policy can be
//! tested and swapped without touching this module.

use crate::config::ApprovalPolicy;
use catsync_core::{
    ChangeId, ChangeStatus, ChangeType, Conflict, ConflictId, ConflictResolution, ConflictRules,
    CoreError, CoreResult, Entity, EntityId, FieldDiff, Severity, StagedChange, SyncStore,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Scores a diff in `[0, 100]`.
///
/// `100 × (1 − weighted mean divergence)`, halved for a version conflict.
pub fn confidence_score(diff: &FieldDiff, rules: &ConflictRules, conflicted: bool) -> u8 {
    let (weighted, total) = diff.iter().fold((0.0, 0.0), |(weighted, total), (name, change)| {
        let weight = rules.rule(name).weight;
        (weighted + weight * change.divergence(), total + weight)
    });
    let mean = if total > 0.0 { weighted / total } else { 0.0 };
    let mut score = (100.0 * (1.0 - mean)).round().clamp(0.0, 100.0);
    if conflicted {
        score = (score / 2.0).floor();
    }
    score as u8
}

/// Result of comparing one change with the live entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    /// Version found in the store.
    pub live_version: u64,
    /// True if the base version is stale.
    pub conflicted: bool,
    /// Diff fields whose live value moved away from the diff's `before`.
    pub conflicting_fields: Vec<String>,
    /// Highest rule severity among conflicting fields.
    pub severity: Option<Severity>,
    /// Confidence score.
    pub confidence: u8,
}

/// Outcome of evaluating one pending change.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// The change after scoring (and rebasing, if auto-resolved).
    pub change: StagedChange,
    /// Conflict recorded for it, if any.
    pub conflict: Option<Conflict>,
    /// True if the approval policy lets it skip manual review.
    pub auto_approve: bool,
}

/// Summary of a detection sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionReport {
    /// Pending changes examined.
    pub examined: usize,
    /// Conflicts left for a reviewer.
    pub conflicts: Vec<ConflictId>,
    /// Conflicts resolved automatically.
    pub auto_resolved: Vec<ConflictId>,
    /// Changes the policy approves.
    pub auto_approve: Vec<ChangeId>,
    /// Changes that could not be evaluated.
    pub errors: Vec<(ChangeId, String)>,
}

/// Compares staged changes against live entities.
pub struct ConflictDetector<S> {
    store: Arc<S>,
    rules: ConflictRules,
    policy: ApprovalPolicy,
}

impl<S: SyncStore> ConflictDetector<S> {
    /// Creates a detector.
    pub fn new(store: Arc<S>, rules: ConflictRules, policy: ApprovalPolicy) -> Self {
        Self {
            store,
            rules,
            policy,
        }
    }

    /// The rule table in use.
    pub fn rules(&self) -> &ConflictRules {
        &self.rules
    }

    /// Compares a change with the live entity without writing anything.
    pub fn assess(&self, change: &StagedChange, live: &Entity) -> Assessment {
        let conflicted = change.base_version != live.version;
        let conflicting_fields: Vec<String> = if conflicted {
            change
                .diff
                .iter()
                .filter(|(name, c)| live.fields.get(name.as_str()) != c.before.as_ref())
                .map(|(name, _)| name.clone())
                .collect()
        } else {
            Vec::new()
        };
        let severity = conflicted
            .then(|| self.rules.severity_of(conflicting_fields.iter().map(String::as_str)));

        Assessment {
            live_version: live.version,
            conflicted,
            conflicting_fields,
            severity,
            confidence: confidence_score(&change.diff, &self.rules, conflicted),
        }
    }

    /// Evaluates one pending change.
    ///
    /// Records a conflict when the base is stale. When the approval policy
    /// allows it, the conflict is resolved with
    /// [`ConflictResolution::KeepStaged`] on the spot.
    pub fn evaluate(&self, change_id: ChangeId) -> CoreResult<Evaluation> {
        let (change, live) = self.pending_with_entity(change_id)?;
        let assessment = self.assess(&change, &live);

        if !assessment.conflicted {
            let change = self
                .store
                .update_change(change_id, ChangeStatus::Pending, |c| {
                    c.confidence_score = assessment.confidence;
                })?;
            return Ok(Evaluation {
                auto_approve: self.policy.allows(assessment.confidence, None),
                change,
                conflict: None,
            });
        }

        let (change, conflict) = self.record(&change, &live, &assessment)?;
        if !self.policy.allows(assessment.confidence, assessment.severity) {
            return Ok(Evaluation {
                change,
                conflict: Some(conflict),
                auto_approve: false,
            });
        }

        info!(
            change_id = %change_id,
            confidence = assessment.confidence,
            severity = ?assessment.severity,
            "auto-resolving conflict"
        );
        let (conflict, change) = self.resolve(conflict.id, ConflictResolution::KeepStaged)?;
        Ok(Evaluation {
            auto_approve: change.status == ChangeStatus::Pending,
            change,
            conflict: Some(conflict),
        })
    }

    /// Evaluates every pending change.
    pub fn sweep(&self) -> DetectionReport {
        let pending = self
            .store
            .list_changes(&|c| c.status == ChangeStatus::Pending);
        let mut report = DetectionReport {
            examined: pending.len(),
            ..DetectionReport::default()
        };

        for change in pending {
            match self.evaluate(change.id) {
                Ok(evaluation) => {
                    if let Some(conflict) = evaluation.conflict {
                        if conflict.is_resolved() {
                            report.auto_resolved.push(conflict.id);
                        } else {
                            report.conflicts.push(conflict.id);
                        }
                    }
                    if evaluation.auto_approve {
                        report.auto_approve.push(change.id);
                    }
                }
                // Approved or rejected concurrently.
                Err(CoreError::InvalidTransition { .. }) => {}
                Err(err) => {
                    warn!(change_id = %change.id, error = %err, "conflict evaluation failed");
                    report.errors.push((change.id, err.to_string()));
                }
            }
        }
        debug!(
            examined = report.examined,
            conflicts = report.conflicts.len(),
            auto_approve = report.auto_approve.len(),
            "conflict sweep finished"
        );
        report
    }

    /// Writes a conflict row for a stale change, reusing an identical
    /// unresolved one.
    pub(crate) fn record(
        &self,
        change: &StagedChange,
        live: &Entity,
        assessment: &Assessment,
    ) -> CoreResult<(StagedChange, Conflict)> {
        let severity = assessment.severity.unwrap_or_default();
        let existing = self
            .store
            .conflicts_for_change(change.id)
            .into_iter()
            .find(|c| !c.is_resolved() && c.live_version == live.version);

        let conflict = match existing {
            Some(conflict) => conflict,
            None => {
                let conflict = Conflict::new(
                    change.id,
                    change.entity_id,
                    assessment.conflicting_fields.clone(),
                    severity,
                    change.base_version,
                    live.version,
                );
                self.store.insert_conflict(conflict.clone())?;
                warn!(
                    change_id = %change.id,
                    entity_id = %change.entity_id,
                    base_version = change.base_version,
                    live_version = live.version,
                    %severity,
                    fields = ?assessment.conflicting_fields,
                    "conflict detected"
                );
                conflict
            }
        };

        self.store.set_has_conflicts(change.entity_id, true)?;
        let change = self
            .store
            .update_change(change.id, change.status, |c| {
                c.conflict_severity = Some(severity);
                c.confidence_score = assessment.confidence;
            })?;
        Ok((change, conflict))
    }

    /// Checks a pending change against the live entity and records a
    /// conflict if the base is stale.
    pub(crate) fn check_fresh(&self, change: &StagedChange) -> CoreResult<Option<Conflict>> {
        let live = self.entity(change.entity_id)?;
        let assessment = self.assess(change, &live);
        if !assessment.conflicted {
            return Ok(None);
        }
        let (_, conflict) = self.record(change, &live, &assessment)?;
        Ok(Some(conflict))
    }

    /// Resolves a conflict.
    ///
    /// `KeepStaged` rebases the change onto the live version;
    /// `DiscardStaged` rejects it. Every other unresolved conflict of the
    /// same change is settled the same way.
    pub fn resolve(
        &self,
        conflict_id: ConflictId,
        resolution: ConflictResolution,
    ) -> CoreResult<(Conflict, StagedChange)> {
        let conflict = self
            .store
            .get_conflict(conflict_id)?
            .ok_or_else(|| CoreError::not_found("conflict", conflict_id))?;
        if conflict.is_resolved() {
            return Err(CoreError::InvalidTransition {
                from: "resolved".into(),
                to: format!("{resolution:?}"),
            });
        }
        let (change, live) = self.pending_with_entity(conflict.staged_change_id)?;

        let resolved = self.store.resolve_conflict(conflict_id, resolution)?;
        for other in self.store.conflicts_for_change(change.id) {
            if !other.is_resolved() {
                self.store.resolve_conflict(other.id, resolution)?;
            }
        }

        let change = match resolution {
            ConflictResolution::KeepStaged => self.rebase(&change, &live)?,
            ConflictResolution::DiscardStaged => self.store.transition_change(
                change.id,
                ChangeStatus::Pending,
                ChangeStatus::Rejected,
                |c| c.error = Some("discarded in favour of the live entity".into()),
            )?,
        };
        self.refresh_conflict_flag(change.entity_id)?;
        info!(conflict_id = %conflict_id, change_id = %change.id, ?resolution, "conflict resolved");
        Ok((resolved, change))
    }

    /// Clears `has_conflicts` once no unresolved conflict is left.
    pub(crate) fn refresh_conflict_flag(&self, entity_id: EntityId) -> CoreResult<()> {
        let open = !self
            .store
            .unresolved_conflicts_for_entity(entity_id)
            .is_empty();
        self.store.set_has_conflicts(entity_id, open)
    }

    /// Moves a pending change onto the live version.
    ///
    /// `before` values are refreshed from the live entity; fields the live
    /// entity already matches drop out. A change left with nothing to do is
    /// rejected.
    fn rebase(&self, change: &StagedChange, live: &Entity) -> CoreResult<StagedChange> {
        let mut diff = change.diff.clone();
        for (name, field) in diff.iter_mut() {
            field.before = live.fields.get(name).cloned();
        }
        if change.change_type != ChangeType::Create {
            diff.retain(|_, field| field.before != field.after);
        }
        let confidence = confidence_score(&diff, &self.rules, false);
        let noop = diff.is_empty() && change.change_type != ChangeType::Delete;

        let rebased = self
            .store
            .update_change(change.id, ChangeStatus::Pending, |c| {
                c.base_version = live.version;
                c.diff = diff;
                c.confidence_score = confidence;
            })?;
        debug!(change_id = %change.id, base_version = live.version, "change rebased");

        if noop {
            return self.store.transition_change(
                change.id,
                ChangeStatus::Pending,
                ChangeStatus::Rejected,
                |c| c.error = Some("no differences left after rebase".into()),
            );
        }
        Ok(rebased)
    }

    fn entity(&self, entity_id: EntityId) -> CoreResult<Entity> {
        self.store
            .get_entity(entity_id)?
            .ok_or_else(|| CoreError::not_found("entity", entity_id))
    }

    fn pending_with_entity(&self, change_id: ChangeId) -> CoreResult<(StagedChange, Entity)> {
        let change = self
            .store
            .get_change(change_id)?
            .ok_or_else(|| CoreError::not_found("staged change", change_id))?;
        if change.status != ChangeStatus::Pending {
            return Err(CoreError::transition(change.status, ChangeStatus::Approved));
        }
        let live = self.entity(change.entity_id)?;
        Ok((change, live))
    }
}
