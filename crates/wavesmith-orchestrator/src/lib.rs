//! Dependency-aware, multi-agent workflow orchestration.
//!
//! Breaks a request into atomic tasks, layers them into maximally parallel
//! waves, binds each task to a capable executor and drives the waves
//! concurrently with timeout, retry and cascading cancellation. Every state
//! change goes through the [`wavesmith_store::TaskStore`], so a workflow can
//! be resumed from the database after a crash.
//!
//! # Main types
//!
//! - [`WorkflowOrchestrator`]: Top-level engine: decompose, schedule, execute, synthesize, validate.
//! - [`DependencyGraph`]: Task graph with cycle detection and wave computation.
//! - [`AgentAssigner`]: Least-load assignment of tasks to executors.
//! - [`ExecutionCoordinator`]: Concurrent wave dispatch with retries.
//! - [`ExecutorMonitor`]: Tracks executor activity and metrics.
//! - [`WavesmithConfig`]: TOML configuration.

/// Capability registry and executor assignment.
pub mod assignment;
/// TOML configuration.
pub mod config;
/// Wave-by-wave concurrent dispatch.
pub mod coordinator;
/// Decomposition service interface.
pub mod decomposition;
/// Workflow engine and request lifecycle.
pub mod engine;
/// Task executor interface.
pub mod executor;
/// Dependency graph and wave scheduling.
pub mod graph;
/// Executor activity and metrics monitoring.
pub mod monitor;
/// Backoff between attempts.
pub mod retry;
/// Shared orchestration types.
pub mod types;

pub use assignment::{
    AgentAssigner, Assignment, AssignmentRequest, AssignmentWarning, CapabilityRegistry,
    StaticCapabilityRegistry,
};
pub use config::WavesmithConfig;
pub use coordinator::{CoordinatorConfig, ExecutionCoordinator, ExecutionReport};
pub use decomposition::{AtomicTask, Decomposition, DecompositionService};
pub use engine::{WorkflowOrchestrator, WorkflowOutcome, WorkflowRequest};
pub use executor::{ExecutionOutcome, ExecutionRequest, TaskExecutor, UpstreamResult};
pub use graph::{DependencyGraph, Schedule};
pub use monitor::{DispatchResult, ExecutorMonitor};
pub use retry::BackoffPolicy;
pub use types::{
    Complexity, ExecutorMetrics, ExecutorState, PhaseRecord, TaskBrief, TaskOutput, WorkerStatus,
    WorkflowPhase,
};
pub use tokio_util::sync::CancellationToken;
