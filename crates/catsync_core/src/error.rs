//! Error types for catsync core.

use crate::types::EntityId;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced synchronously by staging, approval and store operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of record ("entity", "staged change", ...).
        kind: &'static str,
        /// Display form of the missing identifier.
        id: String,
    },

    /// Candidate state or input is malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The entity is locked by another staged change, or an unresolved
    /// conflict blocks the operation.
    #[error("conflict on {entity_id}: {message}")]
    Conflict {
        /// The entity involved.
        entity_id: EntityId,
        /// Description of the conflict.
        message: String,
    },

    /// Optimistic version check failed.
    #[error("version mismatch on {entity_id}: expected {expected}, found {actual}")]
    VersionMismatch {
        /// The entity involved.
        entity_id: EntityId,
        /// Version the caller expected.
        expected: u64,
        /// Version found in the store.
        actual: u64,
    },

    /// A status move not present in the transition table.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Snapshot encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),
}

impl CoreError {
    /// Creates a not-found error.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(entity_id: EntityId, message: impl Into<String>) -> Self {
        Self::Conflict {
            entity_id,
            message: message.into(),
        }
    }

    /// Creates an invalid transition error from any two debuggable states.
    pub fn transition(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        Self::InvalidTransition {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    /// Returns true for errors the caller caused (bad input or state).
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            CoreError::NotFound { .. } | CoreError::Validation(_) | CoreError::Conflict { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeStatus;

    #[test]
    fn error_display() {
        let err = CoreError::not_found("entity", "ent:42");
        assert_eq!(err.to_string(), "entity not found: ent:42");

        let err = CoreError::transition(ChangeStatus::Rejected, ChangeStatus::Approved);
        assert_eq!(
            err.to_string(),
            "invalid state transition from Rejected to Approved"
        );
    }

    #[test]
    fn caller_errors() {
        assert!(CoreError::Validation("empty key".into()).is_caller_error());
        assert!(CoreError::conflict(EntityId::new(), "locked").is_caller_error());
        assert!(!CoreError::Codec("eof".into()).is_caller_error());
    }
}
