//! Per-item application of a batch.
//!
//! For every item: take a pre-change snapshot, perform the remote
//! mutation through the dispatcher and, on success, commit the new entity
//! state, the applied status and the sync version in one store call. A
//! failing item never aborts its siblings.

use crate::dispatch::RemoteDispatcher;
use crate::error::{SyncError, SyncResult};
use crate::events::{percent, EventBus, EventKind, SyncEvent};
use crate::metrics::SyncMetrics;
use crate::remote::{BulkItem, RemoteCatalog, RemoteError};
use catsync_core::{
    apply_diff, fields_digest, is_visible, visible_fields, ApplyCommit, BatchId, BatchStatus,
    ChangeId, ChangeStatus, ChangeType, CoreError, Entity, FieldMap, StagedChange, SyncBatch,
    SyncStore, SyncVersion, Timestamp,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What happened to one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Applied remotely and committed locally.
    Applied,
    /// Failed with an explanatory message.
    Failed(String),
    /// Not in a state this batch can process.
    Skipped,
    /// Already reached a final state in an earlier attempt.
    AlreadyCounted,
}

/// Result of putting an interrupted batch back in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// Back to pending for another attempt.
    Requeued(SyncBatch),
    /// Out of attempts.
    Failed(SyncBatch),
    /// The batch was not running; nothing to do.
    NotRunning,
}

/// An item that passed its pre-checks and is now `Applying`.
struct Prepared {
    change: StagedChange,
    entity: Entity,
    fields: FieldMap,
    outbound: FieldMap,
}

/// Applies batches item by item.
pub struct ApplyEngine<R, S> {
    store: Arc<S>,
    dispatcher: Arc<RemoteDispatcher<R>>,
    metrics: Arc<SyncMetrics>,
    events: Arc<EventBus>,
}

impl<R: RemoteCatalog, S: SyncStore> ApplyEngine<R, S> {
    /// Creates an apply engine.
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<RemoteDispatcher<R>>,
        metrics: Arc<SyncMetrics>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            metrics,
            events,
        }
    }

    /// Runs one attempt of a pending batch to its end.
    ///
    /// `cancel` is checked between items. A cancelled batch fails its
    /// remaining items; applied items stay applied.
    #[instrument(skip_all, fields(batch_id = %batch_id))]
    pub async fn run_batch(&self, batch_id: BatchId, cancel: &AtomicBool) -> SyncResult<SyncBatch> {
        let batch = self.store.transition_batch(
            batch_id,
            BatchStatus::Pending,
            BatchStatus::Running,
            |b| {
                b.attempts += 1;
                b.started_at.get_or_insert_with(Timestamp::now);
            },
        )?;
        self.metrics.batch_started();
        info!(
            attempt = batch.attempts,
            items = batch.len(),
            priority = %batch.priority,
            change_type = batch.change_type.as_str(),
            "batch started"
        );
        self.emit(
            EventKind::OperationStart,
            &batch,
            0,
            format!("applying {} item(s), attempt {}", batch.len(), batch.attempts),
        );

        let cancelled = if batch.change_type == ChangeType::Bulk {
            self.run_bulk(&batch, cancel).await?
        } else {
            self.run_serial(&batch, cancel).await?
        };
        self.finish(batch_id, cancelled)
    }

    async fn run_serial(&self, batch: &SyncBatch, cancel: &AtomicBool) -> SyncResult<bool> {
        for (index, change_id) in batch.item_ids.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                return Ok(true);
            }
            let outcome = match self.prepare(*change_id)? {
                Ok(prepared) => self.apply_one(batch.id, prepared).await?,
                Err(outcome) => outcome,
            };
            self.record(batch, *change_id, &outcome, index + 1)?;
        }
        Ok(false)
    }

    async fn run_bulk(&self, batch: &SyncBatch, cancel: &AtomicBool) -> SyncResult<bool> {
        if cancel.load(Ordering::SeqCst) {
            return Ok(true);
        }

        let mut done = 0;
        let mut prepared = Vec::new();
        for change_id in &batch.item_ids {
            match self.prepare(*change_id)? {
                Ok(item) => prepared.push(item),
                Err(outcome) => {
                    done += 1;
                    self.record(batch, *change_id, &outcome, done)?;
                }
            }
        }
        if prepared.is_empty() {
            return Ok(false);
        }

        let items: Vec<BulkItem> = prepared
            .iter()
            .map(|p| BulkItem {
                external_id: p.entity.external_id.clone().unwrap_or_default(),
                fields: p.outbound.clone(),
            })
            .collect();
        let remote = self.dispatcher.remote();
        let results = self.dispatcher.call(|| remote.bulk_update(&items)).await;

        let per_item: Vec<Option<Result<(), RemoteError>>> = match results {
            Ok(results) => {
                let mut per_item: Vec<_> = results
                    .into_iter()
                    .map(|r| Some(r.map(|_| ())))
                    .collect();
                per_item.resize(prepared.len(), None);
                per_item
            }
            Err(err) => {
                let message = failure_message(&err);
                warn!(error = %err, "bulk call failed; failing every item");
                let mut outcomes = Vec::with_capacity(prepared.len());
                for item in &prepared {
                    let outcome =
                        self.fail(item.change.id, ChangeStatus::Applying, message.clone())?;
                    outcomes.push(outcome);
                }
                for (item, outcome) in prepared.iter().zip(outcomes) {
                    done += 1;
                    self.record(batch, item.change.id, &outcome, done)?;
                }
                return Ok(false);
            }
        };

        for (item, result) in prepared.into_iter().zip(per_item) {
            let change_id = item.change.id;
            let outcome = match result {
                Some(Ok(())) => {
                    let external_id = item.entity.external_id.clone();
                    self.commit(batch.id, item, external_id)?
                }
                Some(Err(RemoteError::Rejected(message))) => {
                    self.fail(change_id, ChangeStatus::Applying, message)?
                }
                Some(Err(err)) => {
                    debug!(
                        change_id = %change_id,
                        error = %err,
                        "bulk item falling back to single update"
                    );
                    self.apply_one(batch.id, item).await?
                }
                None => self.fail(
                    change_id,
                    ChangeStatus::Applying,
                    "remote returned no result for this item; remote state unknown".into(),
                )?,
            };
            done += 1;
            self.record(batch, change_id, &outcome, done)?;
        }
        Ok(false)
    }

    /// Pre-checks an item and moves it to `Applying`, or says why not.
    fn prepare(&self, change_id: ChangeId) -> SyncResult<Result<Prepared, ItemOutcome>> {
        let Some(change) = self.store.get_change(change_id)? else {
            return Ok(Err(ItemOutcome::Skipped));
        };
        match change.status {
            ChangeStatus::Queued => {}
            ChangeStatus::Applied | ChangeStatus::Failed | ChangeStatus::RolledBack => {
                return Ok(Err(ItemOutcome::AlreadyCounted));
            }
            _ => return Ok(Err(ItemOutcome::Skipped)),
        }

        let Some(entity) = self.store.get_entity(change.entity_id)? else {
            return self
                .fail(change_id, ChangeStatus::Queued, "entity no longer exists".into())
                .map(Err);
        };
        if entity.version != change.base_version {
            let message = format!(
                "entity moved from version {} to {} after approval",
                change.base_version, entity.version
            );
            return self.fail(change_id, ChangeStatus::Queued, message).map(Err);
        }
        if change.change_type != ChangeType::Create && entity.external_id.is_none() {
            return self
                .fail(change_id, ChangeStatus::Queued, "entity has no remote id".into())
                .map(Err);
        }

        let mut fields = entity.fields.clone();
        if change.change_type == ChangeType::Delete {
            fields.retain(|name, _| !is_visible(name));
        } else {
            apply_diff(&mut fields, &change.diff);
        }
        let outbound = visible_fields(&fields);

        let change = self.store.transition_change(
            change_id,
            ChangeStatus::Queued,
            ChangeStatus::Applying,
            |_| {},
        )?;
        Ok(Ok(Prepared {
            change,
            entity,
            fields,
            outbound,
        }))
    }

    /// Pushes one prepared item and commits it.
    async fn apply_one(&self, batch_id: BatchId, item: Prepared) -> SyncResult<ItemOutcome> {
        let remote = self.dispatcher.remote();
        let external_id = item.entity.external_id.clone().unwrap_or_default();
        let pushed = match item.change.change_type {
            ChangeType::Create => self
                .dispatcher
                .call(|| remote.create(&item.outbound))
                .await
                .map(|ack| Some(ack.external_id)),
            ChangeType::Update | ChangeType::Bulk => self
                .dispatcher
                .call(|| remote.update(&external_id, &item.outbound))
                .await
                .map(|ack| Some(ack.external_id)),
            ChangeType::Delete => self
                .dispatcher
                .call(|| remote.delete(&external_id))
                .await
                .map(|()| None),
        };

        match pushed {
            Ok(new_external_id) => self.commit(batch_id, item, new_external_id),
            Err(err) => self.fail(item.change.id, ChangeStatus::Applying, failure_message(&err)),
        }
    }

    /// Writes the local side of a successful remote mutation.
    ///
    /// `item.entity` is the state read before the remote call; it is both
    /// the snapshot and the compare-and-set base, so an edit that landed
    /// during the call fails the commit instead of being overwritten.
    fn commit(
        &self,
        batch_id: BatchId,
        item: Prepared,
        external_id: Option<String>,
    ) -> SyncResult<ItemOutcome> {
        let Prepared {
            change,
            entity,
            fields,
            outbound,
        } = item;
        let has_conflicts = self
            .store
            .get_entity(entity.id)?
            .filter(|stored| stored.version == entity.version)
            .map_or(entity.has_conflicts, |stored| stored.has_conflicts);
        let expected_version = entity.version;
        let applied_version = expected_version + 1;

        let version = SyncVersion::new(
            entity.id,
            batch_id,
            change.id,
            change.change_type,
            entity.snapshot(),
            applied_version,
            fields_digest(&outbound)?,
        );
        let updated = Entity {
            id: entity.id,
            external_id,
            version: applied_version,
            last_sync_version: applied_version,
            sync_locked: false,
            fields,
            has_conflicts,
        };

        match self.store.commit_apply(ApplyCommit {
            change_id: change.id,
            entity: updated,
            expected_version,
            version,
        }) {
            Ok(()) => {
                debug!(
                    change_id = %change.id,
                    entity_id = %entity.id,
                    version = applied_version,
                    "item applied"
                );
                Ok(ItemOutcome::Applied)
            }
            Err(CoreError::VersionMismatch { expected, actual, .. }) => {
                error!(
                    change_id = %change.id,
                    entity_id = %entity.id,
                    expected,
                    actual,
                    "entity edited during remote call"
                );
                self.fail(
                    change.id,
                    ChangeStatus::Applying,
                    format!(
                        "applied remotely but entity moved from version {expected} to {actual} \
                         during the remote call; local state kept"
                    ),
                )
            }
            Err(err) => {
                error!(
                    change_id = %change.id,
                    entity_id = %entity.id,
                    error = %err,
                    "remote mutation succeeded but local commit failed"
                );
                self.fail(
                    change.id,
                    ChangeStatus::Applying,
                    format!("applied remotely but local commit failed: {err}"),
                )
            }
        }
    }

    fn fail(
        &self,
        change_id: ChangeId,
        from: ChangeStatus,
        message: String,
    ) -> SyncResult<ItemOutcome> {
        warn!(change_id = %change_id, reason = %message, "item failed");
        let stored = message.clone();
        self.store
            .transition_change(change_id, from, ChangeStatus::Failed, |c| {
                c.error = Some(stored);
            })?;
        Ok(ItemOutcome::Failed(message))
    }

    fn record(
        &self,
        batch: &SyncBatch,
        change_id: ChangeId,
        outcome: &ItemOutcome,
        done: usize,
    ) -> SyncResult<()> {
        match outcome {
            ItemOutcome::Applied => self.metrics.item_succeeded(),
            ItemOutcome::Failed(_) => self.metrics.item_failed(),
            ItemOutcome::Skipped => self.metrics.item_skipped(),
            ItemOutcome::AlreadyCounted => {}
        }
        let updated = self
            .store
            .update_batch(batch.id, BatchStatus::Running, |b| match outcome {
                ItemOutcome::Applied => b.stats.succeeded += 1,
                ItemOutcome::Failed(_) => b.stats.failed += 1,
                ItemOutcome::Skipped => b.stats.skipped += 1,
                ItemOutcome::AlreadyCounted => {}
            })?;
        let message = match outcome {
            ItemOutcome::Applied => format!("{change_id} applied"),
            ItemOutcome::Failed(reason) => format!("{change_id} failed: {reason}"),
            ItemOutcome::Skipped => format!("{change_id} skipped"),
            ItemOutcome::AlreadyCounted => format!("{change_id} already finished"),
        };
        self.emit(
            EventKind::Progress,
            &updated,
            percent(done, batch.len()),
            message,
        );
        Ok(())
    }

    fn finish(&self, batch_id: BatchId, cancelled: bool) -> SyncResult<SyncBatch> {
        if cancelled {
            let failed = self.fail_queued(batch_id, "batch cancelled")?;
            let batch = self.store.transition_batch(
                batch_id,
                BatchStatus::Running,
                BatchStatus::Failed,
                |b| {
                    b.stats.failed += failed;
                    b.completed_at = Some(Timestamp::now());
                    b.error = Some(SyncError::Cancelled.to_string());
                },
            )?;
            warn!(
                succeeded = batch.stats.succeeded,
                failed = batch.stats.failed,
                "batch cancelled"
            );
            self.emit(EventKind::Complete, &batch, 100, "batch cancelled".into());
            self.metrics.batch_finished(&batch);
            return Ok(batch);
        }

        let batch = self.store.transition_batch(
            batch_id,
            BatchStatus::Running,
            BatchStatus::Completed,
            |b| {
                b.completed_at = Some(Timestamp::now());
            },
        )?;
        info!(
            succeeded = batch.stats.succeeded,
            failed = batch.stats.failed,
            skipped = batch.stats.skipped,
            duration_ms = batch.duration_ms().unwrap_or(0),
            "batch completed"
        );
        let message = format!(
            "{} succeeded, {} failed, {} skipped",
            batch.stats.succeeded, batch.stats.failed, batch.stats.skipped
        );
        self.emit(EventKind::Complete, &batch, 100, message);
        self.metrics.batch_finished(&batch);
        Ok(batch)
    }

    /// Fails every item of a batch that is still queued.
    pub(crate) fn fail_queued(&self, batch_id: BatchId, reason: &str) -> SyncResult<u32> {
        let batch = self
            .store
            .get_batch(batch_id)?
            .ok_or_else(|| CoreError::not_found("batch", batch_id))?;
        let mut failed = 0;
        for change_id in &batch.item_ids {
            let queued = self
                .store
                .get_change(*change_id)?
                .is_some_and(|c| c.status == ChangeStatus::Queued);
            if queued {
                self.fail(*change_id, ChangeStatus::Queued, reason.to_string())?;
                self.metrics.item_failed();
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Cleans up after a worker crash or timeout.
    ///
    /// Items caught mid-flight are failed because the remote outcome is
    /// unknown. The batch goes back to pending while attempts remain,
    /// otherwise it fails along with its queued items.
    pub(crate) fn recover(
        &self,
        batch_id: BatchId,
        reason: &str,
        max_attempts: u32,
    ) -> SyncResult<Recovery> {
        let Some(batch) = self.store.get_batch(batch_id)? else {
            return Ok(Recovery::NotRunning);
        };
        if batch.status != BatchStatus::Running {
            return Ok(Recovery::NotRunning);
        }

        let mut interrupted = 0;
        for change_id in &batch.item_ids {
            let applying = self
                .store
                .get_change(*change_id)?
                .is_some_and(|c| c.status == ChangeStatus::Applying);
            if applying {
                self.fail(
                    *change_id,
                    ChangeStatus::Applying,
                    format!("interrupted ({reason}); remote state unknown"),
                )?;
                self.metrics.item_failed();
                interrupted += 1;
            }
        }

        if batch.attempts < max_attempts {
            let batch = self.store.transition_batch(
                batch_id,
                BatchStatus::Running,
                BatchStatus::Pending,
                |b| {
                    b.stats.failed += interrupted;
                    b.error = Some(reason.to_string());
                },
            )?;
            self.metrics.batch_requeued();
            warn!(batch_id = %batch_id, attempts = batch.attempts, reason, "batch requeued");
            return Ok(Recovery::Requeued(batch));
        }

        let exhausted = format!("gave up after {} attempt(s): {reason}", batch.attempts);
        let failed = self.fail_queued(batch_id, &exhausted)?;
        let batch = self.store.transition_batch(
            batch_id,
            BatchStatus::Running,
            BatchStatus::Failed,
            |b| {
                b.stats.failed += interrupted + failed;
                b.completed_at = Some(Timestamp::now());
                b.error = Some(exhausted.clone());
            },
        )?;
        error!(batch_id = %batch_id, reason, "batch failed permanently");
        self.emit(EventKind::Complete, &batch, 100, exhausted);
        self.metrics.batch_finished(&batch);
        Ok(Recovery::Failed(batch))
    }

    fn emit(&self, kind: EventKind, batch: &SyncBatch, progress: u8, message: String) {
        self.events.emit(SyncEvent::new(
            kind,
            batch.id,
            batch.status,
            progress,
            message,
        ));
    }
}

/// Message stored on a failed item. Rejections carry the remote text as is.
fn failure_message(err: &SyncError) -> String {
    match err {
        SyncError::RemoteRejected(message) => message.clone(),
        other => other.to_string(),
    }
}
