//! Worker loop, batch supervision and the pool sampler.

use crate::apply::Recovery;
use crate::engine::EngineInner;
use crate::error::SyncError;
use crate::pool::ScaleDecision;
use crate::remote::RemoteCatalog;
use crate::scheduler::ReadyBatch;
use catsync_core::{BatchId, SyncBatch, SyncStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// How long an idle worker sleeps when no wake-up arrives.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Registers and spawns one worker.
pub(crate) fn spawn_worker<R: RemoteCatalog, S: SyncStore>(
    inner: &Arc<EngineInner<R, S>>,
) -> JoinHandle<()> {
    let worker_id = inner.supervisor.worker_started();
    tokio::spawn(run_worker(Arc::clone(inner), worker_id))
}

#[instrument(skip(inner))]
async fn run_worker<R: RemoteCatalog, S: SyncStore>(inner: Arc<EngineInner<R, S>>, worker_id: u64) {
    debug!("worker started");
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        if *shutdown.borrow() {
            inner.supervisor.worker_stopped();
            debug!("worker stopped");
            return;
        }
        if inner.supervisor.try_retire() {
            info!(active = inner.supervisor.active(), "worker retired");
            return;
        }

        // Registered before popping so a push in between still wakes us.
        let notified = inner.wakeup.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match inner.scheduler.pop_ready() {
            Some((priority, ready)) => {
                debug!(batch_id = %ready.batch_id, %priority, "batch picked up");
                execute_batch(&inner, ready).await;
            }
            None => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
        }
    }
}

/// Runs one batch attempt in its own task and cleans up after a panic or
/// timeout. Returns the batch once it is final, or `None` if it went back
/// to the ready queue.
pub(crate) async fn execute_batch<R: RemoteCatalog, S: SyncStore>(
    inner: &Arc<EngineInner<R, S>>,
    ready: ReadyBatch,
) -> Option<SyncBatch> {
    let batch_id = ready.batch_id;
    let cancel = inner.cancel_flag(batch_id);
    let timeout = inner.config.pool.batch_timeout;

    let task_inner = Arc::clone(inner);
    let mut handle =
        tokio::spawn(async move { task_inner.apply.run_batch(batch_id, &cancel).await });

    let interruption = match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(_))) => None,
        Ok(Ok(Err(err))) => Some(err.to_string()),
        Ok(Err(join_err)) if join_err.is_panic() => {
            Some(SyncError::WorkerCrashed("panic while applying".into()).to_string())
        }
        Ok(Err(_)) => Some(SyncError::WorkerCrashed("task aborted".into()).to_string()),
        Err(_) => {
            handle.abort();
            let _ = handle.await;
            Some(format!("batch timed out after {}ms", timeout.as_millis()))
        }
    };

    if let Some(reason) = interruption {
        warn!(batch_id = %batch_id, reason = %reason, "batch interrupted");
        match inner
            .apply
            .recover(batch_id, &reason, inner.config.pool.max_batch_attempts)
        {
            Ok(Recovery::Requeued(batch)) => {
                inner.scheduler.push_ready(
                    batch.priority,
                    ReadyBatch {
                        batch_id,
                        len: batch.len(),
                    },
                );
                inner.wakeup.notify_waiters();
                return None;
            }
            Ok(Recovery::Failed(_) | Recovery::NotRunning) => {}
            Err(err) => error!(batch_id = %batch_id, error = %err, "batch recovery failed"),
        }
    }

    finished(inner, batch_id)
}

fn finished<R: RemoteCatalog, S: SyncStore>(
    inner: &EngineInner<R, S>,
    batch_id: BatchId,
) -> Option<SyncBatch> {
    inner.cancels.lock().remove(&batch_id);
    inner.completions.send_modify(|n| *n += 1);
    match inner.store.get_batch(batch_id) {
        Ok(batch) => batch,
        Err(err) => {
            error!(batch_id = %batch_id, error = %err, "batch lookup failed");
            None
        }
    }
}

/// Periodically resizes the pool from queue depth and host load.
#[instrument(skip_all)]
pub(crate) async fn run_sampler<R: RemoteCatalog, S: SyncStore>(inner: Arc<EngineInner<R, S>>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut ticker = tokio::time::interval(inner.config.pool.sample_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            debug!("sampler stopped");
            return;
        }

        let ready = inner.scheduler.ready_batches();
        let sample = inner.probe.sample();
        match inner.supervisor.decide(ready, sample) {
            ScaleDecision::Up => {
                let handle = spawn_worker(&inner);
                inner.tasks.lock().push(handle);
                info!(
                    active = inner.supervisor.active(),
                    ready,
                    cpu_load = sample.cpu_load,
                    "scaled up"
                );
            }
            ScaleDecision::Down => {
                if inner.supervisor.request_retire() {
                    inner.wakeup.notify_waiters();
                    info!(
                        active = inner.supervisor.active(),
                        memory_pressure = sample.memory_pressure,
                        "scaling down"
                    );
                }
            }
            ScaleDecision::Hold => {}
        }
    }
}
