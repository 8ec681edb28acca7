//! Core types and error definitions for the Wavesmith orchestration engine.
//!
//! This crate provides the foundational types shared across all Wavesmith crates.
//!
//! # Main types
//!
//! - [`WavesmithError`]: Unified error enum for all Wavesmith subsystems.
//! - [`WavesmithResult`]: Convenience alias for `Result<T, WavesmithError>`.
//! - [`Payload`]: Opaque serialized blob used for task context and results.

/// Opaque task payloads.
pub mod payload;

pub use payload::Payload;

use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the Wavesmith engine.
///
/// Graph-level variants abort a scheduling attempt; executor variants are
/// contained within a single task and consume its retry budget.
#[derive(Debug, thiserror::Error)]
pub enum WavesmithError {
    /// An unknown task, workflow or dependency id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The dependency graph contains a cycle; carries the tasks left unscheduled.
    #[error("Dependency cycle detected among tasks: {0:?}")]
    CycleDetected(Vec<Uuid>),

    /// No executor advertises the capability. Recovered by the default executor.
    #[error("No executor advertises capability '{0}'")]
    UnassignableCapability(String),

    /// The executor reported a failure for one attempt.
    #[error("Executor failure: {0}")]
    ExecutorFailure(String),

    /// The executor did not answer within the task timeout (seconds).
    #[error("timeout after {0}s")]
    ExecutorTimeout(u64),

    /// The retry budget is spent; the task is terminally failed.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made, including the first.
        attempts: u32,
        /// Error reported by the final attempt.
        last_error: String,
    },

    /// Malformed input, such as an empty decomposition.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An error from the persistent task store.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An error from the workflow orchestrator itself.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),
}

impl WavesmithError {
    /// Whether this error aborts the whole scheduling attempt.
    pub fn is_graph_level(&self) -> bool {
        matches!(
            self,
            WavesmithError::CycleDetected(_)
                | WavesmithError::NotFound(_)
                | WavesmithError::InvalidInput(_)
        )
    }
}

/// A convenience `Result` alias using [`WavesmithError`].
pub type WavesmithResult<T> = Result<T, WavesmithError>;
