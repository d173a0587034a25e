//! Priority lanes, aging and batch formation.
//!
//! Every priority has its own lane behind its own lock, so producers and
//! workers touching different priorities never contend. There is no lock
//! over the whole queue.

use catsync_core::{BatchId, ChangeId, ChangeType, EntityId, Priority, SyncBatch};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct Waiting<T> {
    item: T,
    since: Instant,
}

/// Five FIFO lanes, one per priority, with anti-starvation aging.
#[derive(Debug)]
pub struct PriorityLanes<T> {
    lanes: [Mutex<VecDeque<Waiting<T>>>; 5],
    aging_threshold: Duration,
}

impl<T> PriorityLanes<T> {
    /// Creates empty lanes.
    pub fn new(aging_threshold: Duration) -> Self {
        Self {
            lanes: Default::default(),
            aging_threshold,
        }
    }

    /// Appends an item to its lane.
    pub fn push(&self, priority: Priority, item: T) {
        self.lanes[priority.index()].lock().push_back(Waiting {
            item,
            since: Instant::now(),
        });
    }

    /// Moves every item that waited past the threshold up one level.
    ///
    /// The wait clock restarts on promotion, so an item climbs at most one
    /// level per call. `Critical` never ages.
    pub fn promote_aged(&self) -> usize {
        let now = Instant::now();
        let mut promoted = 0;
        for priority in &Priority::ALL[1..] {
            let aged: Vec<_> = {
                let mut lane = self.lanes[priority.index()].lock();
                let mut aged = Vec::new();
                while lane
                    .front()
                    .is_some_and(|w| now.saturating_duration_since(w.since) >= self.aging_threshold)
                {
                    if let Some(waiting) = lane.pop_front() {
                        aged.push(waiting.item);
                    }
                }
                aged
            };
            if aged.is_empty() {
                continue;
            }
            promoted += aged.len();
            let mut target = self.lanes[priority.promoted().index()].lock();
            target.extend(aged.into_iter().map(|item| Waiting { item, since: now }));
        }
        promoted
    }

    /// Pops the oldest item of the highest non-empty lane.
    pub fn pop(&self) -> Option<(Priority, T)> {
        Priority::ALL.iter().find_map(|priority| {
            self.lanes[priority.index()]
                .lock()
                .pop_front()
                .map(|w| (*priority, w.item))
        })
    }

    /// Removes and returns everything, highest priority first.
    pub fn drain(&self) -> Vec<(Priority, T)> {
        let mut out = Vec::new();
        for priority in Priority::ALL {
            let items: Vec<_> = self.lanes[priority.index()].lock().drain(..).collect();
            out.extend(items.into_iter().map(|w| (priority, w.item)));
        }
        out
    }

    /// Removes the first item matching `predicate`.
    pub fn remove_first<P>(&self, predicate: P) -> Option<(Priority, T)>
    where
        P: Fn(&T) -> bool,
    {
        Priority::ALL.iter().find_map(|priority| {
            let mut lane = self.lanes[priority.index()].lock();
            let position = lane.iter().position(|w| predicate(&w.item))?;
            lane.remove(position).map(|w| (*priority, w.item))
        })
    }

    /// Sums `weight` over each lane.
    pub fn depth_by<F>(&self, weight: F) -> BTreeMap<Priority, usize>
    where
        F: Fn(&T) -> usize,
    {
        Priority::ALL
            .iter()
            .map(|priority| {
                let lane = self.lanes[priority.index()].lock();
                (*priority, lane.iter().map(|w| weight(&w.item)).sum())
            })
            .collect()
    }

    /// Total items across lanes.
    pub fn len(&self) -> usize {
        self.lanes.iter().map(|lane| lane.lock().len()).sum()
    }

    /// Returns true if every lane is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An approved change waiting to be batched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedChange {
    /// The change.
    pub change_id: ChangeId,
    /// Its entity.
    pub entity_id: EntityId,
    /// Its remote mutation kind.
    pub change_type: ChangeType,
}

/// A formed batch waiting for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyBatch {
    /// The batch.
    pub batch_id: BatchId,
    /// Items it carries.
    pub len: usize,
}

/// Groups approved changes into bounded batches and queues them for
/// workers.
#[derive(Debug)]
pub struct BatchScheduler {
    approved: PriorityLanes<QueuedChange>,
    ready: PriorityLanes<ReadyBatch>,
    max_batch_size: usize,
}

impl BatchScheduler {
    /// Creates a scheduler.
    pub fn new(max_batch_size: usize, aging_threshold: Duration) -> Self {
        Self {
            approved: PriorityLanes::new(aging_threshold),
            ready: PriorityLanes::new(aging_threshold),
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Queues an approved change.
    pub fn enqueue(&self, priority: Priority, change: QueuedChange) {
        self.approved.push(priority, change);
    }

    /// Approved changes not yet in a batch.
    pub fn waiting(&self) -> usize {
        self.approved.len()
    }

    /// Drains the approved lanes into batches.
    ///
    /// Items are grouped by `(priority, change_type)` in FIFO order and
    /// chunked by the maximum batch size. The returned batches are not
    /// persisted yet.
    pub fn form_batches(&self) -> Vec<(SyncBatch, Vec<QueuedChange>)> {
        let promoted = self.approved.promote_aged();
        if promoted > 0 {
            debug!(promoted, "aged changes promoted");
        }

        let mut groups: BTreeMap<(Priority, ChangeType), Vec<QueuedChange>> = BTreeMap::new();
        for (priority, change) in self.approved.drain() {
            groups
                .entry((priority, change.change_type))
                .or_default()
                .push(change);
        }

        let mut batches = Vec::new();
        for ((priority, change_type), changes) in groups {
            for chunk in changes.chunks(self.max_batch_size) {
                let ids = chunk.iter().map(|c| c.change_id).collect();
                batches.push((SyncBatch::new(priority, change_type, ids), chunk.to_vec()));
            }
        }
        batches
    }

    /// Queues a persisted batch for the workers.
    pub fn push_ready(&self, priority: Priority, batch: ReadyBatch) {
        self.ready.push(priority, batch);
    }

    /// Takes the next batch to run.
    pub fn pop_ready(&self) -> Option<(Priority, ReadyBatch)> {
        self.ready.promote_aged();
        self.ready.pop()
    }

    /// Pulls a batch back out of the ready queue.
    pub fn remove_ready(&self, batch_id: BatchId) -> bool {
        self.ready
            .remove_first(|b| b.batch_id == batch_id)
            .is_some()
    }

    /// Batches waiting for a worker.
    pub fn ready_batches(&self) -> usize {
        self.ready.len()
    }

    /// Items waiting per priority: unbatched plus batched but not started.
    pub fn queue_depth_by_priority(&self) -> BTreeMap<Priority, usize> {
        let mut depth = self.approved.depth_by(|_| 1);
        for (priority, items) in self.ready.depth_by(|b| b.len) {
            *depth.entry(priority).or_default() += items;
        }
        depth
    }
}
