//! Error types for the sync engine.

use crate::remote::RemoteError;
use catsync_core::CoreError;
use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while staging, scheduling or applying changes.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Store, validation, conflict or transition error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The remote kept throttling past the configured retry budget.
    #[error("remote throttled the request (retry after {retry_after:?})")]
    RateLimited {
        /// Hint from the remote, if any.
        retry_after: Option<Duration>,
    },

    /// Retryable remote failure that exhausted its attempts.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// The remote permanently refused the mutation.
    #[error("remote rejected the mutation: {0}")]
    RemoteRejected(String),

    /// A remote call did not finish in time.
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    /// The batch was cancelled.
    #[error("batch cancelled")]
    Cancelled,

    /// The engine has not been started or is shutting down.
    #[error("engine is not running")]
    NotRunning,

    /// A worker panicked or timed out while holding a batch.
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Returns true if the same operation may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimited { .. } | SyncError::Transient(_) | SyncError::Timeout(_)
        )
    }

    /// Returns true if the caller's request was at fault.
    pub fn is_caller_error(&self) -> bool {
        match self {
            SyncError::Core(err) => err.is_caller_error(),
            SyncError::Config(_) => true,
            _ => false,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Throttled { retry_after } => SyncError::RateLimited { retry_after },
            RemoteError::Transient(message) => SyncError::Transient(message),
            RemoteError::Rejected(message) => SyncError::RemoteRejected(message),
        }
    }
}
