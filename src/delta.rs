// Copyright 2025 Cowboy AI, LLC.

//! Persisted history records

use crate::identifiers::{DeltaId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Name of a table holding rows owned by deltas of one command kind
///
/// Each command kind keeps its payload in its own table, keyed by delta id.
/// Truncating history deletes from every owned table the registry knows
/// about, so a kind that forgets to declare a table leaks rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OwnedTable(&'static str);

impl OwnedTable {
    /// Declare a table name
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Table name
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for OwnedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// One reversible, persisted unit of change to a workflow
///
/// The base fields are shared by every command kind; `kind` selects the
/// handler that interprets `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Position in the global append-only sequence
    pub id: DeltaId,
    /// Workflow this delta belongs to
    pub workflow_id: WorkflowId,
    /// The delta that preceded this one, `None` for the root
    pub prev_delta_id: Option<DeltaId>,
    /// When the delta was created
    pub datetime: DateTime<Utc>,
    /// Command kind discriminator
    pub kind: String,
    /// Kind-specific data, including bookkeeping written by forward/backward
    pub payload: Value,
}

impl Delta {
    /// Whether this delta starts its workflow's history
    pub fn is_root(&self) -> bool {
        self.prev_delta_id.is_none()
    }
}

impl fmt::Display for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} #{}", self.datetime.to_rfc3339(), self.kind, self.id)
    }
}

/// A delta as presented in a workflow's history listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    /// The delta's ID
    pub id: DeltaId,
    /// Command kind
    pub kind: String,
    /// Human-readable description from the command's handler
    pub description: String,
    /// When the delta was created
    pub datetime: DateTime<Utc>,
    /// `false` for entries on the redo branch, after the head
    pub applied: bool,
}
