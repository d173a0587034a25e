//! # catsync engine
//!
//! Staged, review-before-apply synchronization of a local catalog with a
//! rate-limited remote commerce platform.
//!
//! This crate provides:
//! - Change staging with per-entity locking
//! - Conflict detection, confidence scoring and resolution
//! - An approval gate with compare-and-set approval
//! - A priority scheduler with aging and bounded batches
//! - An elastic worker pool with crash and timeout recovery
//! - An apply engine with rate limiting, retries and sync versions
//! - Batch rollback with per-item outcome reporting
//! - Metrics, batch history and progress events
//!
//! ## Workflow
//!
//! 1. `stage` diffs a candidate against the entity and locks it
//! 2. `approve` (or `detect_conflicts` with auto-approval) queues it
//! 3. `start_batch` groups queued changes into batches for the workers
//! 4. Workers apply each item remotely, then commit it locally
//! 5. `rollback` reverts a batch from its recorded snapshots
//!
//! ## Key Invariants
//!
//! - At most one active staged change per entity
//! - Every remote call takes a rate token and has a timeout
//! - A failing item never aborts its batch; every item ends in a
//!   queryable final state with a message
//! - Every applied item has exactly one sync version row

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod approval;
mod config;
mod detector;
mod dispatch;
mod engine;
mod error;
mod events;
mod metrics;
mod pool;
mod rate_limiter;
mod remote;
mod rollback;
mod scheduler;
mod stager;
mod worker;

pub use apply::{ApplyEngine, ItemOutcome, Recovery};
pub use approval::{ApprovalGate, BulkApprovalReport};
pub use config::{
    ApprovalPolicy, EngineConfig, PoolConfig, RateLimitConfig, RetryConfig, SchedulerConfig,
};
pub use detector::{confidence_score, Assessment, ConflictDetector, DetectionReport, Evaluation};
pub use dispatch::RemoteDispatcher;
pub use engine::{SyncEngine, SyncEngineBuilder, AUTO_REVIEWER};
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, EventKind, EventPublisher, MemoryPublisher, SyncEvent};
pub use metrics::{BatchRecord, MetricsSnapshot, SyncMetrics, HISTORY_CAPACITY};
pub use pool::{LoadProbe, LoadSample, ManualLoad, PoolSupervisor, ScaleDecision, StaticLoad};
pub use rate_limiter::{RateLimiter, RateLimiterState};
pub use remote::{
    BulkItem, MockCatalog, RateBudget, RemoteAck, RemoteCall, RemoteCatalog, RemoteError,
    RemoteResult,
};
pub use rollback::{RollbackEngine, RollbackItemOutcome, RollbackReport};
pub use scheduler::{BatchScheduler, PriorityLanes, QueuedChange, ReadyBatch};
pub use stager::{ChangeStager, StageRequest};
