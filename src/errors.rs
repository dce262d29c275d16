// Copyright 2025 Cowboy AI, LLC.

//! Error types for history operations

use crate::identifiers::{DeltaId, WorkflowId};
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable classification of a [`DeltaError`]
///
/// Callers branch on the kind, never on the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Arguments rejected by a command's `amend`; nothing changed
    Validation,
    /// A referenced workflow, tab, step or delta does not exist
    NotFound,
    /// The workflow lock could not be acquired in time
    Busy,
    /// The history head moved since the caller last observed it
    Conflict,
    /// Applying a delta failed after validation, or the chain is corrupt
    Fatal,
    /// The backing store failed
    Storage,
}

impl ErrorKind {
    /// Tag used in logs and API responses
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Busy => "busy",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while creating, applying or reverting deltas
#[derive(Debug, Clone, Error)]
pub enum DeltaError {
    /// Command arguments were rejected
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Referenced entity is missing
    #[error("Entity not found: {entity_type} with id {id}")]
    EntityNotFound {
        /// Type of entity that wasn't found
        entity_type: &'static str,
        /// ID that was searched for
        id: String,
    },

    /// Lock acquisition timed out
    #[error("Workflow {workflow_id} is busy: lock not acquired within {waited_ms}ms")]
    Busy {
        /// Workflow whose lock was contended
        workflow_id: WorkflowId,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// The lock expired or was taken over before the move was committed
    #[error("Lost the lock on workflow {workflow_id} before committing")]
    LockLost {
        /// Workflow whose lock was lost
        workflow_id: WorkflowId,
    },

    /// Undo or redo against a moved head
    #[error("History conflict: expected head {}, but found {}", fmt_head(.expected), fmt_head(.actual))]
    HeadConflict {
        /// Head the operation required
        expected: Option<DeltaId>,
        /// Head actually stored
        actual: Option<DeltaId>,
    },

    /// Forward or backward application failed
    #[error("Failed to apply delta {delta_id} ({kind}): {reason}")]
    ApplyFailed {
        /// Delta being applied
        delta_id: DeltaId,
        /// Command kind of the delta
        kind: String,
        /// Underlying failure
        reason: String,
    },

    /// The stored history violates a chain invariant
    #[error("Corrupt history for workflow {workflow_id}: {reason}")]
    CorruptHistory {
        /// Workflow whose chain is broken
        workflow_id: WorkflowId,
        /// First violation found
        reason: String,
    },

    /// No handler is registered for a command kind
    #[error("Unknown command kind: {0}")]
    UnknownCommand(String),

    /// Payload could not be (de)serialized
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Storage failure, propagated unmodified
    #[error(transparent)]
    Storage(#[from] StoreError),
}

fn fmt_head(head: &Option<DeltaId>) -> String {
    head.map_or_else(|| "<none>".to_string(), |id| id.to_string())
}

/// Result type for history operations
pub type DeltaResult<T> = Result<T, DeltaError>;

impl From<serde_json::Error> for DeltaError {
    fn from(err: serde_json::Error) -> Self {
        DeltaError::SerializationError(err.to_string())
    }
}

impl DeltaError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        DeltaError::ValidationError(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(entity_type: &'static str, id: impl ToString) -> Self {
        DeltaError::EntityNotFound {
            entity_type,
            id: id.to_string(),
        }
    }

    /// Stable kind tag
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeltaError::ValidationError(_) => ErrorKind::Validation,
            DeltaError::EntityNotFound { .. } => ErrorKind::NotFound,
            DeltaError::Busy { .. } | DeltaError::LockLost { .. } => ErrorKind::Busy,
            DeltaError::HeadConflict { .. } => ErrorKind::Conflict,
            DeltaError::ApplyFailed { .. }
            | DeltaError::CorruptHistory { .. }
            | DeltaError::UnknownCommand(_)
            | DeltaError::SerializationError(_) => ErrorKind::Fatal,
            DeltaError::Storage(StoreError::WorkflowNotFound(_))
            | DeltaError::Storage(StoreError::DeltaNotFound(_)) => ErrorKind::NotFound,
            DeltaError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Check if this is a validation error
    pub fn is_validation_error(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    /// Check if this is a head conflict
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Whether the caller may simply try again
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Busy | ErrorKind::Conflict)
    }
}
