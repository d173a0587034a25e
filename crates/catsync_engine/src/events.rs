//! Progress events for dashboards and other observers.
//!
//! The engine only emits events. Transport (WebSocket or otherwise) is the
//! subscriber's business.

use catsync_core::{BatchId, BatchStatus, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Phase of a batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A worker picked the batch up.
    OperationStart,
    /// An item finished.
    Progress,
    /// The batch finished.
    Complete,
}

/// One event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Phase.
    pub kind: EventKind,
    /// Batch the event is about.
    pub batch_id: BatchId,
    /// Batch status when the event was emitted.
    pub status: BatchStatus,
    /// Items accounted for, in percent.
    pub progress_percent: u8,
    /// Emission time.
    pub timestamp: Timestamp,
    /// Human-readable summary.
    pub message: String,
}

impl SyncEvent {
    /// Creates an event stamped now.
    pub fn new(
        kind: EventKind,
        batch_id: BatchId,
        status: BatchStatus,
        progress_percent: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            batch_id,
            status,
            progress_percent: progress_percent.min(100),
            timestamp: Timestamp::now(),
            message: message.into(),
        }
    }
}

/// Consumer of engine events.
pub trait EventPublisher: Send + Sync + 'static {
    /// Delivers one event. Must not block.
    fn publish(&self, event: &SyncEvent);
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<SyncEvent>>,
}

impl MemoryPublisher {
    /// Creates an empty publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Events received for one batch.
    pub fn events_for(&self, batch_id: BatchId) -> Vec<SyncEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.batch_id == batch_id)
            .cloned()
            .collect()
    }
}

impl EventPublisher for MemoryPublisher {
    fn publish(&self, event: &SyncEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Fan-out of events to a broadcast channel and any registered publishers.
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
    sinks: Vec<Arc<dyn EventPublisher>>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per slow receiver.
    pub fn new(capacity: usize, sinks: Vec<Arc<dyn EventPublisher>>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, sinks }
    }

    /// Opens a new receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Having no receivers is fine.
    pub fn emit(&self, event: SyncEvent) {
        for sink in &self.sinks {
            sink.publish(&event);
        }
        let _ = self.sender.send(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.sender.receiver_count())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Percentage of `done` over `total`, 100 for an empty batch.
pub(crate) fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from((done.min(total) * 100) / total).unwrap_or(100)
}
