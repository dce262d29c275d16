// Copyright 2025 Cowboy AI, LLC.

//! # CIM Delta
//!
//! Undo/redo history for collaboratively edited workflows.
//!
//! Every user edit is a command recorded as a [`Delta`]: a reversible,
//! persisted change linked to the delta before it. A workflow's history is
//! the chain of its deltas; its head (`last_delta`) is the state users see.
//!
//! - **Create**: run a command's `amend`, discard any redo branch, apply the
//!   new delta and make it the head
//! - **Undo / Redo**: move the head one delta back or forward
//! - **Notify**: tell clients exactly which workflow fields, steps and tabs
//!   changed, then ask for a recompute when rendered output went stale
//!
//! All mutations of one workflow are serialized by a per-workflow lock
//! ([`LockManager`]); the store commits each history move as a single write
//! ([`DeltaStore::commit`]).
//!
//! ## Adding a command kind
//!
//! Implement [`Command`] and register it with
//! [`CommandRegistry::register`]. The engine only ever reaches command kinds
//! through the registry.

#![warn(missing_docs)]

mod chain;
mod config;
mod delta;
mod document;
mod engine;
mod errors;
mod identifiers;
mod notify;

pub mod commands;
pub mod lock;
pub mod metrics;
pub mod sinks;
pub mod store;

pub use chain::HistoryChain;
pub use commands::{
    ApplyContext, ApplyOutcome, ChildRef, Command, CommandHandler, CommandRegistry,
    ReferencedChildren,
};
pub use config::EngineConfig;
pub use delta::{Delta, HistoryEntry, OwnedTable};
pub use document::{OutputStatus, Step, Tab, Workflow, WorkflowDocument};
pub use engine::DeltaEngine;
pub use errors::{DeltaError, DeltaResult, ErrorKind};
pub use identifiers::{DeltaId, StepId, TabId, WorkflowId};
pub use lock::{InProcessLockManager, LockManager, NatsKvLockManager, WorkflowLock};
pub use metrics::EngineMetrics;
pub use notify::{
    DeltaNotification, StepUpdate, StepVersionUpdate, StepView, TabView, WorkflowUpdate,
};
pub use sinks::{
    NatsNotifier, NatsRecomputeScheduler, NotificationSink, RecomputeScheduler,
    RecordingNotifier, RecordingScheduler,
};
pub use store::{DeltaStore, InMemoryDeltaStore, StoreError};
