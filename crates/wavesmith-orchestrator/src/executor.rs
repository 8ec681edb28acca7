use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wavesmith_core::Payload;

/// Output of a completed dependency, handed to its dependents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamResult {
    pub task_id: Uuid,
    pub result: Option<Payload>,
    pub artifacts: Vec<String>,
}

/// Everything an executor gets for one attempt of one task.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: Uuid,
    pub workflow_id: String,
    /// Executor id the task is bound to.
    pub agent: String,
    pub action: String,
    pub description: String,
    pub context: Payload,
    pub timeout: Duration,
    /// Zero-based attempt number; equals the task's retry count.
    pub attempt: u32,
    pub upstream: Vec<UpstreamResult>,
    /// Fires when the workflow is cancelled. The coordinator stops waiting
    /// either way; honoring it lets the executor release resources early.
    pub cancel: CancellationToken,
}

/// What an executor reports back. Failures are values, never errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub result: Payload,
    pub artifacts: Vec<String>,
    pub error: Option<String>,
    pub execution_time: Duration,
}

impl ExecutionOutcome {
    /// A successful attempt.
    pub fn success(result: Payload) -> Self {
        Self {
            success: true,
            result,
            ..Self::default()
        }
    }

    /// A failed attempt.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_execution_time(mut self, elapsed: Duration) -> Self {
        self.execution_time = elapsed;
        self
    }
}

/// Runs one attempt of a task on behalf of the coordinator.
///
/// Timeouts are enforced by the caller. Panics inside an implementation are
/// contained and reported as a failed attempt.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_builders() {
        let ok = ExecutionOutcome::success(Payload::from(serde_json::json!("done")))
            .with_artifacts(vec!["src/lib.rs".into()])
            .with_execution_time(Duration::from_millis(12));
        assert!(ok.success);
        assert!(ok.error.is_none());
        assert_eq!(ok.artifacts, vec!["src/lib.rs"]);

        let failed = ExecutionOutcome::failure("compile error");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("compile error"));
        assert!(failed.result.is_empty());
    }
}
