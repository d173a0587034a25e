//! Batch rollback from recorded sync versions.
//!
//! Rollback is best effort and reported per item. The local revert
//! restores the exact snapshot taken before the apply. The remote side
//! gets a compensating mutation unless the record was touched remotely
//! since the batch ran.

use crate::dispatch::RemoteDispatcher;
use crate::error::SyncResult;
use crate::metrics::SyncMetrics;
use crate::remote::RemoteCatalog;
use catsync_core::{
    fields_digest, visible_fields, BatchId, BatchStatus, ChangeId, ChangeStatus, ChangeType,
    CoreError, EntityId, RollbackCommit, SyncStore, SyncVersion,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Outcome of reverting one applied item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackItemOutcome {
    /// The reverted change.
    pub change_id: ChangeId,
    /// Its entity.
    pub entity_id: EntityId,
    /// Local entity restored from the snapshot.
    pub reverted_locally: bool,
    /// Compensating remote mutation succeeded.
    pub reverted_remotely: bool,
    /// Why something was not reverted.
    pub reason: Option<String>,
}

impl RollbackItemOutcome {
    fn new(change_id: ChangeId, entity_id: EntityId) -> Self {
        Self {
            change_id,
            entity_id,
            reverted_locally: false,
            reverted_remotely: false,
            reason: None,
        }
    }

    fn skipped(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// True if both sides were reverted.
    pub fn is_complete(&self) -> bool {
        self.reverted_locally && self.reverted_remotely
    }
}

/// Per-item results of a batch rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    /// The batch.
    pub batch_id: BatchId,
    /// One entry per applied item, in the order they were reverted.
    pub items: Vec<RollbackItemOutcome>,
    /// Batch status after the rollback.
    pub batch_status: BatchStatus,
}

impl RollbackReport {
    /// Items that were not fully reverted.
    pub fn partial(&self) -> Vec<&RollbackItemOutcome> {
        self.items.iter().filter(|i| !i.is_complete()).collect()
    }

    /// True if every item was reverted on both sides.
    pub fn is_complete(&self) -> bool {
        self.items.iter().all(RollbackItemOutcome::is_complete)
    }
}

/// Result of the remote half of one revert.
struct Compensation {
    done: bool,
    reason: Option<String>,
    external_id_override: Option<String>,
}

impl Compensation {
    fn done(external_id_override: Option<String>) -> Self {
        Self {
            done: true,
            reason: None,
            external_id_override,
        }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            done: false,
            reason: Some(reason.into()),
            external_id_override: None,
        }
    }
}

/// Reverts completed or failed batches.
pub struct RollbackEngine<R, S> {
    store: Arc<S>,
    dispatcher: Arc<RemoteDispatcher<R>>,
    metrics: Arc<SyncMetrics>,
}

impl<R: RemoteCatalog, S: SyncStore> RollbackEngine<R, S> {
    /// Creates a rollback engine.
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<RemoteDispatcher<R>>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            metrics,
        }
    }

    /// Reverts every applied item of a batch, newest first.
    ///
    /// The batch moves to `RolledBack` only if it was `Completed` and every
    /// applied item was reverted locally.
    #[instrument(skip_all, fields(batch_id = %batch_id))]
    pub async fn rollback(&self, batch_id: BatchId) -> SyncResult<RollbackReport> {
        let batch = self
            .store
            .get_batch(batch_id)?
            .ok_or_else(|| CoreError::not_found("batch", batch_id))?;
        if !matches!(batch.status, BatchStatus::Completed | BatchStatus::Failed) {
            return Err(CoreError::transition(batch.status, BatchStatus::RolledBack).into());
        }

        let mut items = Vec::new();
        for change_id in batch.item_ids.iter().rev() {
            let Some(change) = self.store.get_change(*change_id)? else {
                continue;
            };
            if change.status != ChangeStatus::Applied {
                continue;
            }
            let outcome = match self.store.version_for_change(change.id) {
                Some(version) => self.revert(version).await?,
                None => RollbackItemOutcome::new(change.id, change.entity_id)
                    .skipped("no sync version recorded"),
            };
            if let Some(reason) = &outcome.reason {
                warn!(
                    change_id = %outcome.change_id,
                    entity_id = %outcome.entity_id,
                    reverted_locally = outcome.reverted_locally,
                    reverted_remotely = outcome.reverted_remotely,
                    reason = %reason,
                    "item not fully reverted"
                );
            }
            items.push(outcome);
        }

        let all_local = items.iter().all(|i| i.reverted_locally);
        let batch_status = if batch.status == BatchStatus::Completed && all_local {
            match self.store.transition_batch(
                batch_id,
                BatchStatus::Completed,
                BatchStatus::RolledBack,
                |_| {},
            ) {
                Ok(batch) => {
                    self.metrics.batch_rolled_back();
                    batch.status
                }
                Err(CoreError::InvalidTransition { .. }) => self
                    .store
                    .get_batch(batch_id)?
                    .map_or(batch.status, |b| b.status),
                Err(err) => return Err(err.into()),
            }
        } else {
            batch.status
        };

        let report = RollbackReport {
            batch_id,
            items,
            batch_status,
        };
        info!(
            items = report.items.len(),
            partial = report.partial().len(),
            status = ?report.batch_status,
            "rollback finished"
        );
        Ok(report)
    }

    async fn revert(&self, version: SyncVersion) -> SyncResult<RollbackItemOutcome> {
        let mut outcome = RollbackItemOutcome::new(version.change_id, version.entity_id);
        let Some(entity) = self.store.get_entity(version.entity_id)? else {
            return Ok(outcome.skipped("entity no longer exists"));
        };
        if entity.sync_locked {
            return Ok(outcome.skipped("entity has an active staged change"));
        }
        if entity.version != version.applied_version {
            return Ok(outcome.skipped(format!(
                "entity moved to version {} after the apply (expected {})",
                entity.version, version.applied_version
            )));
        }

        let compensation = self.compensate(&version, entity.external_id.as_deref()).await;
        outcome.reverted_remotely = compensation.done;
        outcome.reason = compensation.reason;

        let commit = RollbackCommit {
            change_id: version.change_id,
            entity_id: version.entity_id,
            expected_version: version.applied_version,
            snapshot: version.snapshot,
            external_id_override: compensation.external_id_override,
        };
        match self.store.commit_rollback(commit) {
            Ok(_) => outcome.reverted_locally = true,
            Err(err) => {
                let reason = match outcome.reason.take() {
                    Some(remote) => format!("{remote}; local revert failed: {err}"),
                    None => format!("local revert failed: {err}"),
                };
                outcome.reason = Some(reason);
            }
        }
        Ok(outcome)
    }

    async fn compensate(&self, version: &SyncVersion, current_id: Option<&str>) -> Compensation {
        let remote = self.dispatcher.remote();

        if version.change_type == ChangeType::Delete {
            let Some(old_id) = version.snapshot.external_id.as_deref() else {
                return Compensation::skipped("snapshot has no remote id");
            };
            match self.dispatcher.call(|| remote.fetch(old_id)).await {
                Ok(None) => {}
                Ok(Some(_)) => return Compensation::skipped("remote record still exists"),
                Err(err) => return Compensation::skipped(format!("remote unreadable: {err}")),
            }
            let fields = visible_fields(&version.snapshot.fields);
            return match self.dispatcher.call(|| remote.create(&fields)).await {
                Ok(ack) => Compensation::done(Some(ack.external_id)),
                Err(err) => Compensation::skipped(format!("compensating create failed: {err}")),
            };
        }

        let Some(external_id) = current_id else {
            return Compensation::skipped("entity has no remote id");
        };
        let live = match self.dispatcher.call(|| remote.fetch(external_id)).await {
            Ok(Some(fields)) => fields,
            Ok(None) => return Compensation::skipped("remote record no longer exists"),
            Err(err) => return Compensation::skipped(format!("remote unreadable: {err}")),
        };
        match fields_digest(&live) {
            Ok(digest) if digest == version.applied_digest => {}
            Ok(_) => return Compensation::skipped("remote record modified since the batch"),
            Err(err) => return Compensation::skipped(format!("remote unreadable: {err}")),
        }

        let result = if version.change_type == ChangeType::Create {
            self.dispatcher.call(|| remote.delete(external_id)).await
        } else {
            let fields = visible_fields(&version.snapshot.fields);
            self.dispatcher
                .call(|| remote.update(external_id, &fields))
                .await
                .map(|_| ())
        };
        match result {
            Ok(()) => Compensation::done(None),
            Err(err) => Compensation::skipped(format!("compensating mutation failed: {err}")),
        }
    }
}
