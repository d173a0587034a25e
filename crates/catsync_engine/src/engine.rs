//! The engine control surface.
//!
//! [`SyncEngine`] wires the stager, detector, approval gate, scheduler,
//! worker pool, apply engine and rollback engine around one store and one
//! remote. Every operation of the staged workflow goes through it.
//!
//! ```rust,ignore
//! let engine = SyncEngine::builder(EngineConfig::default(), remote, store).build()?;
//! let change = engine.stage(StageRequest::update(id, fields))?.unwrap();
//! engine.approve(change, "ops@example.com")?;
//! let batches = engine.start_batch()?;
//! engine.run_until_idle().await;
//! ```

use crate::apply::ApplyEngine;
use crate::approval::{ApprovalGate, BulkApprovalReport};
use crate::config::EngineConfig;
use crate::detector::{ConflictDetector, DetectionReport};
use crate::dispatch::RemoteDispatcher;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, EventKind, EventPublisher, SyncEvent};
use crate::metrics::{BatchRecord, MetricsSnapshot, SyncMetrics};
use crate::pool::{LoadProbe, PoolSupervisor, StaticLoad};
use crate::rate_limiter::{RateLimiter, RateLimiterState};
use crate::remote::RemoteCatalog;
use crate::rollback::{RollbackEngine, RollbackReport};
use crate::scheduler::{BatchScheduler, QueuedChange, ReadyBatch};
use crate::stager::{ChangeStager, StageRequest};
use crate::worker::{execute_batch, run_sampler, spawn_worker};
use catsync_core::{
    BatchId, BatchStatus, ChangeId, ChangeStatus, Conflict, ConflictId, ConflictResolution,
    CoreError, CoreResult, Entity, EntityId, StagedChange, SyncBatch, SyncStore, Timestamp,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Reviewer name recorded on changes approved by the detection sweep.
pub const AUTO_REVIEWER: &str = "auto";

/// Default buffer of the broadcast event channel.
const EVENT_CAPACITY: usize = 1024;

/// Shared state behind every engine handle and worker task.
pub(crate) struct EngineInner<R, S> {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<S>,
    pub(crate) stager: ChangeStager<S>,
    pub(crate) detector: Arc<ConflictDetector<S>>,
    pub(crate) gate: ApprovalGate<S>,
    pub(crate) scheduler: BatchScheduler,
    pub(crate) supervisor: PoolSupervisor,
    pub(crate) apply: ApplyEngine<R, S>,
    pub(crate) rollback: RollbackEngine<R, S>,
    pub(crate) dispatcher: Arc<RemoteDispatcher<R>>,
    pub(crate) metrics: Arc<SyncMetrics>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) probe: Arc<dyn LoadProbe>,
    /// Wakes idle workers when batches become ready.
    pub(crate) wakeup: Notify,
    pub(crate) shutdown: watch::Sender<bool>,
    /// Bumped every time a batch reaches a final state.
    pub(crate) completions: watch::Sender<u64>,
    pub(crate) cancels: Mutex<HashMap<BatchId, Arc<AtomicBool>>>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) running: AtomicBool,
}

impl<R, S> EngineInner<R, S> {
    pub(crate) fn cancel_flag(&self, batch_id: BatchId) -> Arc<AtomicBool> {
        Arc::clone(
            self.cancels
                .lock()
                .entry(batch_id)
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder<R, S> {
    config: EngineConfig,
    remote: Arc<R>,
    store: Arc<S>,
    probe: Arc<dyn LoadProbe>,
    publishers: Vec<Arc<dyn EventPublisher>>,
    event_capacity: usize,
}

impl<R: RemoteCatalog, S: SyncStore> SyncEngineBuilder<R, S> {
    /// Uses a load probe for pool scaling (default: idle host).
    #[must_use]
    pub fn load_probe(mut self, probe: Arc<dyn LoadProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Adds an event publisher.
    #[must_use]
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    /// Sets the broadcast channel buffer.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validates the configuration and assembles the engine.
    ///
    /// A rate budget advertised by the remote replaces the configured
    /// burst size and refill rate, and must pass the same checks.
    pub fn build(self) -> SyncResult<SyncEngine<R, S>> {
        let config = self.config;
        config.validate()?;

        let mut rate_limit = config.rate_limit.clone();
        if let Some(budget) = self.remote.rate_budget() {
            rate_limit.burst_size = budget.burst_size;
            rate_limit.refill_per_sec = budget.refill_per_sec;
            if let Err(SyncError::Config(reason)) = rate_limit.validate() {
                return Err(SyncError::Config(format!("remote rate budget rejected: {reason}")));
            }
        }

        let metrics = Arc::new(SyncMetrics::new());
        let limiter = Arc::new(RateLimiter::new(rate_limit));
        let dispatcher = Arc::new(RemoteDispatcher::new(
            self.remote,
            limiter,
            config.retry.clone(),
            config.remote_timeout,
            Arc::clone(&metrics),
        ));
        let events = Arc::new(EventBus::new(self.event_capacity, self.publishers));
        let detector = Arc::new(ConflictDetector::new(
            Arc::clone(&self.store),
            config.rules.clone(),
            config.approval.clone(),
        ));
        let (shutdown, _) = watch::channel(false);
        let (completions, _) = watch::channel(0);

        let inner = EngineInner {
            stager: ChangeStager::new(Arc::clone(&self.store), config.rules.clone()),
            gate: ApprovalGate::new(Arc::clone(&self.store), Arc::clone(&detector)),
            detector,
            scheduler: BatchScheduler::new(
                config.scheduler.max_batch_size,
                config.scheduler.aging_threshold,
            ),
            supervisor: PoolSupervisor::new(config.pool.clone()),
            apply: ApplyEngine::new(
                Arc::clone(&self.store),
                Arc::clone(&dispatcher),
                Arc::clone(&metrics),
                Arc::clone(&events),
            ),
            rollback: RollbackEngine::new(
                Arc::clone(&self.store),
                Arc::clone(&dispatcher),
                Arc::clone(&metrics),
            ),
            dispatcher,
            metrics,
            events,
            probe: self.probe,
            wakeup: Notify::new(),
            shutdown,
            completions,
            cancels: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            store: self.store,
            config,
        };
        Ok(SyncEngine {
            inner: Arc::new(inner),
        })
    }
}

/// Staged synchronization engine.
///
/// Cheap to clone; clones share the same engine. Call
/// [`shutdown`](Self::shutdown) before dropping the last handle of a
/// started engine so worker tasks exit.
pub struct SyncEngine<R, S> {
    inner: Arc<EngineInner<R, S>>,
}

impl<R, S> Clone for SyncEngine<R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RemoteCatalog, S: SyncStore> SyncEngine<R, S> {
    /// Starts building an engine.
    pub fn builder(config: EngineConfig, remote: Arc<R>, store: Arc<S>) -> SyncEngineBuilder<R, S> {
        SyncEngineBuilder {
            config,
            remote,
            store,
            probe: Arc::new(StaticLoad::default()),
            publishers: Vec::new(),
            event_capacity: EVENT_CAPACITY,
        }
    }

    /// Builds an engine with the default probe and no publishers.
    pub fn new(config: EngineConfig, remote: Arc<R>, store: Arc<S>) -> SyncResult<Self> {
        Self::builder(config, remote, store).build()
    }

    // --- staging and review ---

    /// Stages a change. Returns `None` when there is nothing to change.
    pub fn stage(&self, request: StageRequest) -> SyncResult<Option<ChangeId>> {
        Ok(self.inner.stager.stage(&request)?.map(|c| c.id))
    }

    /// Approves a pending change and queues it for batching.
    pub fn approve(&self, change_id: ChangeId, reviewer: &str) -> SyncResult<StagedChange> {
        let change = self.inner.gate.approve(change_id, reviewer)?;
        self.enqueue(&change);
        Ok(change)
    }

    /// Rejects a pending change.
    pub fn reject(&self, change_id: ChangeId, reviewer: &str) -> SyncResult<StagedChange> {
        Ok(self.inner.gate.reject(change_id, reviewer)?)
    }

    /// Approves every pending change matching `predicate`.
    pub fn bulk_approve<P>(&self, predicate: P, reviewer: &str) -> BulkApprovalReport
    where
        P: Fn(&StagedChange) -> bool,
    {
        let report = self.inner.gate.bulk_approve(predicate, reviewer);
        for change_id in &report.approved {
            match self.inner.store.get_change(*change_id) {
                Ok(Some(change)) => self.enqueue(&change),
                Ok(None) => warn!(change_id = %change_id, "approved change vanished"),
                Err(err) => {
                    warn!(change_id = %change_id, error = %err, "approved change unreadable")
                }
            }
        }
        report
    }

    /// Resolves a conflict. `KeepStaged` rebases the change so it can be
    /// approved; `DiscardStaged` rejects it.
    pub fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        resolution: ConflictResolution,
    ) -> SyncResult<(Conflict, StagedChange)> {
        Ok(self.inner.detector.resolve(conflict_id, resolution)?)
    }

    /// Evaluates every pending change and approves those the policy
    /// allows.
    pub fn detect_conflicts(&self) -> DetectionReport {
        let mut report = self.inner.detector.sweep();
        let candidates = std::mem::take(&mut report.auto_approve);
        for change_id in candidates {
            match self.approve(change_id, AUTO_REVIEWER) {
                Ok(_) => report.auto_approve.push(change_id),
                Err(err) => report.errors.push((change_id, err.to_string())),
            }
        }
        if !report.auto_approve.is_empty() {
            info!(approved = report.auto_approve.len(), "changes auto-approved");
        }
        report
    }

    fn enqueue(&self, change: &StagedChange) {
        self.inner.scheduler.enqueue(
            change.priority,
            QueuedChange {
                change_id: change.id,
                entity_id: change.entity_id,
                change_type: change.change_type,
            },
        );
    }

    // --- batching ---

    /// Forms batches from every queued approval and hands them to workers.
    ///
    /// Each item is checked against the live entity one last time: a moved
    /// entity blocks the change instead of queueing it. Returns the ids of
    /// the new batches.
    pub fn start_batch(&self) -> SyncResult<Vec<BatchId>> {
        let mut formed = Vec::new();
        for (mut batch, items) in self.inner.scheduler.form_batches() {
            let mut kept = Vec::with_capacity(items.len());
            for item in items {
                match self.queue_item(batch.id, item) {
                    Ok(true) => kept.push(item.change_id),
                    Ok(false) => {}
                    Err(err) => {
                        warn!(
                            change_id = %item.change_id,
                            error = %err,
                            "change left out of batch"
                        );
                    }
                }
            }
            if kept.is_empty() {
                continue;
            }
            batch.item_ids = kept;
            self.inner.store.insert_batch(batch.clone())?;
            self.inner.scheduler.push_ready(
                batch.priority,
                ReadyBatch {
                    batch_id: batch.id,
                    len: batch.len(),
                },
            );
            info!(
                batch_id = %batch.id,
                priority = %batch.priority,
                change_type = batch.change_type.as_str(),
                items = batch.len(),
                "batch formed"
            );
            formed.push(batch.id);
        }
        if !formed.is_empty() {
            self.inner.wakeup.notify_waiters();
        }
        Ok(formed)
    }

    /// Moves one approved change into a batch, or blocks it.
    fn queue_item(&self, batch_id: BatchId, item: QueuedChange) -> CoreResult<bool> {
        let store = &self.inner.store;
        let change = store
            .get_change(item.change_id)?
            .ok_or_else(|| CoreError::not_found("staged change", item.change_id))?;
        if change.status != ChangeStatus::Approved {
            return Ok(false);
        }
        let live = store
            .get_entity(change.entity_id)?
            .ok_or_else(|| CoreError::not_found("entity", change.entity_id))?;

        if live.version != change.base_version {
            let detector = &self.inner.detector;
            let assessment = detector.assess(&change, &live);
            let (_, conflict) = detector.record(&change, &live, &assessment)?;
            store.transition_change(
                change.id,
                ChangeStatus::Approved,
                ChangeStatus::Blocked,
                |c| {
                    c.error = Some(format!(
                        "entity moved from version {} to {} before queueing",
                        change.base_version, live.version
                    ));
                },
            )?;
            // Blocked is terminal; the conflict no longer awaits a decision.
            store.resolve_conflict(conflict.id, ConflictResolution::DiscardStaged)?;
            detector.refresh_conflict_flag(change.entity_id)?;
            warn!(
                change_id = %change.id,
                entity_id = %change.entity_id,
                base_version = change.base_version,
                live_version = live.version,
                "change blocked at enqueue"
            );
            return Ok(false);
        }

        // An edit landing after this check is caught by the apply engine's
        // base version check before any remote call.
        store.transition_change(
            change.id,
            ChangeStatus::Approved,
            ChangeStatus::Queued,
            |c| c.batch_id = Some(batch_id),
        )?;
        Ok(true)
    }

    /// Cancels a batch.
    ///
    /// A pending batch fails at once along with its items. A running batch
    /// stops before its next item; items already applied stay applied.
    pub fn cancel_batch(&self, batch_id: BatchId) -> SyncResult<SyncBatch> {
        let batch = self.batch(batch_id)?;
        match batch.status {
            BatchStatus::Pending | BatchStatus::Running => {}
            other => return Err(CoreError::transition(other, BatchStatus::Failed).into()),
        }
        self.inner.cancel_flag(batch_id).store(true, Ordering::SeqCst);
        self.inner.scheduler.remove_ready(batch_id);

        let cancelled = self.inner.store.transition_batch(
            batch_id,
            BatchStatus::Pending,
            BatchStatus::Failed,
            |b| b.error = Some(SyncError::Cancelled.to_string()),
        );
        match cancelled {
            Ok(_) => {
                let failed = self.inner.apply.fail_queued(batch_id, "batch cancelled")?;
                let batch = self.inner.store.update_batch(batch_id, BatchStatus::Failed, |b| {
                    b.stats.failed += failed;
                    b.completed_at = Some(Timestamp::now());
                })?;
                self.inner.metrics.batch_finished(&batch);
                self.inner.events.emit(SyncEvent::new(
                    EventKind::Complete,
                    batch_id,
                    batch.status,
                    100,
                    "batch cancelled before start",
                ));
                self.inner.cancels.lock().remove(&batch_id);
                self.inner.completions.send_modify(|n| *n += 1);
                info!(batch_id = %batch_id, items = failed, "pending batch cancelled");
                Ok(batch)
            }
            // A worker got there first; the flag stops it between items.
            Err(CoreError::InvalidTransition { .. }) => {
                info!(batch_id = %batch_id, "cancellation requested for running batch");
                self.batch(batch_id)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Reverts a completed or failed batch.
    pub async fn rollback(&self, batch_id: BatchId) -> SyncResult<RollbackReport> {
        self.inner.rollback.rollback(batch_id).await
    }

    // --- running ---

    /// Starts the worker pool and the scaling sampler.
    ///
    /// Must be called from inside a tokio runtime. Starting a running
    /// engine does nothing.
    pub fn start(&self) -> SyncResult<()> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::Config(format!("engine needs a tokio runtime: {e}")))?;
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.send_replace(false);

        let workers = self.inner.config.pool.min_workers;
        let mut tasks = self.inner.tasks.lock();
        for _ in 0..workers {
            tasks.push(spawn_worker(&self.inner));
        }
        tasks.push(tokio::spawn(run_sampler(Arc::clone(&self.inner))));
        info!(workers, max_workers = self.inner.config.pool.max_workers, "engine started");
        Ok(())
    }

    /// Stops workers and the sampler. Batches in flight finish first.
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.send_replace(true);
        self.inner.wakeup.notify_waiters();

        loop {
            let tasks = std::mem::take(&mut *self.inner.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(err) = task.await {
                    warn!(error = %err, "engine task ended abnormally");
                }
            }
        }
        info!("engine stopped");
    }

    /// Returns true between [`start`](Self::start) and
    /// [`shutdown`](Self::shutdown).
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Runs every ready batch on the calling task until none is left.
    ///
    /// Needs no started pool; used by the CLI and deterministic tests.
    /// Returns the batches that reached a final state, in finishing order.
    pub async fn run_until_idle(&self) -> Vec<SyncBatch> {
        let mut finished = Vec::new();
        while let Some((_, ready)) = self.inner.scheduler.pop_ready() {
            if let Some(batch) = execute_batch(&self.inner, ready).await {
                finished.push(batch);
            }
        }
        finished
    }

    /// Waits until a batch reaches a final state.
    ///
    /// Fails with [`SyncError::NotRunning`] if the batch is still pending
    /// or running and no pool is started to move it along.
    pub async fn wait_for_batch(&self, batch_id: BatchId) -> SyncResult<SyncBatch> {
        let mut completions = self.inner.completions.subscribe();
        loop {
            let batch = self.batch(batch_id)?;
            if batch.status.is_finished() {
                return Ok(batch);
            }
            if !self.is_running() {
                return Err(SyncError::NotRunning);
            }
            completions
                .changed()
                .await
                .map_err(|_| SyncError::NotRunning)?;
        }
    }

    // --- observation ---

    /// Counters, gauges and recent batch history.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot(
            self.inner.scheduler.queue_depth_by_priority(),
            self.inner.supervisor.active(),
        )
    }

    /// The batch history ring, oldest first.
    pub fn history(&self) -> Vec<BatchRecord> {
        self.inner.metrics.history()
    }

    /// Opens a receiver for batch events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Current rate limiter state.
    pub fn rate_limiter(&self) -> RateLimiterState {
        self.inner.dispatcher.limiter().state()
    }

    /// Reads a staged change.
    pub fn change(&self, change_id: ChangeId) -> SyncResult<StagedChange> {
        Ok(self
            .inner
            .store
            .get_change(change_id)?
            .ok_or_else(|| CoreError::not_found("staged change", change_id))?)
    }

    /// Reads a batch.
    pub fn batch(&self, batch_id: BatchId) -> SyncResult<SyncBatch> {
        Ok(self
            .inner
            .store
            .get_batch(batch_id)?
            .ok_or_else(|| CoreError::not_found("batch", batch_id))?)
    }

    /// Lists every batch, oldest first.
    pub fn batches(&self) -> Vec<SyncBatch> {
        self.inner.store.list_batches(&|_| true)
    }

    /// Reads an entity.
    pub fn entity(&self, entity_id: EntityId) -> SyncResult<Entity> {
        Ok(self
            .inner
            .store
            .get_entity(entity_id)?
            .ok_or_else(|| CoreError::not_found("entity", entity_id))?)
    }

    /// Conflicts recorded for a change, oldest first.
    pub fn conflicts_for(&self, change_id: ChangeId) -> Vec<Conflict> {
        self.inner.store.conflicts_for_change(change_id)
    }

    /// The configuration in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// Workers currently running.
    pub fn active_workers(&self) -> usize {
        self.inner.supervisor.active()
    }
}
