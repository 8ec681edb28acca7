//! Durable task store for Wavesmith workflows.
//!
//! Tasks and their append-only state history live in SQLite; a write-through
//! cache keeps hot tasks in memory. Everything the orchestrator needs to
//! resume after a crash is readable from the database alone.
//!
//! # Main types
//!
//! - [`TaskStore`]: CRUD, state transitions, queries, retention and export.
//! - [`Task`] / [`TaskState`]: A unit of work and its lifecycle.
//! - [`WorkflowSummary`]: Derived per-workflow counts and completion reason.

mod rows;
/// The task store itself.
pub mod store;
/// Derived workflow summaries and audit exports.
pub mod summary;
/// Task, state and history types.
pub mod task;

pub use store::{Clock, TaskQuery, TaskStore};
pub use summary::{CompletionReason, WorkflowExport, WorkflowSummary};
pub use task::{
    HistoryEntry, NewTask, Priority, StateUpdate, Task, TaskState, DEFAULT_MAX_RETRIES,
    DEFAULT_TIMEOUT_SECS,
};
