use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wavesmith_core::Payload;
use wavesmith_store::Task;

/// Relative effort of an atomic task; drives load balancing and confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Weight 1.
    Simple,
    /// Weight 2.
    #[default]
    Moderate,
    /// Weight 3.
    Complex,
}

impl Complexity {
    /// Load weight used by assignment and validation.
    pub fn weight(self) -> u32 {
        match self {
            Complexity::Simple => 1,
            Complexity::Moderate => 2,
            Complexity::Complex => 3,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Simple => write!(f, "simple"),
            Complexity::Moderate => write!(f, "moderate"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

/// Request-level lifecycle phase of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowPhase {
    Received,
    Decomposed,
    Scheduled,
    Executing,
    Synthesized,
    /// Every required task completed with enough confidence.
    Validated,
    /// Completed work is kept but validation did not pass.
    Partial,
    /// Stopped by a graph-level failure or a cancel.
    Aborted,
}

impl WorkflowPhase {
    /// Whether the workflow will not move any further.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            WorkflowPhase::Validated | WorkflowPhase::Partial | WorkflowPhase::Aborted
        )
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowPhase::Received => write!(f, "received"),
            WorkflowPhase::Decomposed => write!(f, "decomposed"),
            WorkflowPhase::Scheduled => write!(f, "scheduled"),
            WorkflowPhase::Executing => write!(f, "executing"),
            WorkflowPhase::Synthesized => write!(f, "synthesized"),
            WorkflowPhase::Validated => write!(f, "validated"),
            WorkflowPhase::Partial => write!(f, "partial"),
            WorkflowPhase::Aborted => write!(f, "aborted"),
        }
    }
}

/// One entry of a workflow's phase log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: WorkflowPhase,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

/// What the orchestrator stores in each task's context payload.
///
/// Keeps the planning metadata next to the task so a restarted process can
/// re-assign and re-validate a workflow from the database alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBrief {
    /// Id the decomposition used for this task.
    pub local_id: String,
    pub task_type: String,
    pub required_capability: String,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl TaskBrief {
    /// Read the brief back from a task, falling back to what the task row
    /// itself says when the context holds something else.
    pub fn of(task: &Task) -> Self {
        task.context.decode().unwrap_or_else(|_| Self {
            local_id: task.id.to_string(),
            task_type: task.action.clone(),
            required_capability: task.agent.clone(),
            complexity: Complexity::default(),
            required: true,
        })
    }
}

/// Per-task output gathered during synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: Uuid,
    pub local_id: String,
    pub description: String,
    pub executor: String,
    pub state: wavesmith_store::TaskState,
    pub complexity: Complexity,
    pub required: bool,
    pub result: Option<Payload>,
    pub artifacts: Vec<String>,
    pub error: Option<String>,
}

/// Metrics tracked per executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorMetrics {
    pub dispatches: u32,
    pub completions: u32,
    pub failures: u32,
    pub timeouts: u32,
    pub duration_ms: u64,
}

/// Real-time snapshot of one executor's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorState {
    pub executor_id: String,
    /// Tasks currently in flight on this executor.
    pub active_tasks: Vec<Uuid>,
    pub status: WorkerStatus,
    pub metrics: ExecutorMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Working,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavesmith_store::TaskState;

    fn bare_task() -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            workflow_id: "wf".into(),
            agent: "rust".into(),
            action: "implement".into(),
            description: String::new(),
            state: TaskState::Pending,
            priority: Default::default(),
            context: Payload::empty(),
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            timeout_secs: 300,
            retry_count: 0,
            max_retries: 3,
            result: None,
            error: None,
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn test_complexity_weights() {
        assert_eq!(Complexity::Simple.weight(), 1);
        assert_eq!(Complexity::Moderate.weight(), 2);
        assert_eq!(Complexity::Complex.weight(), 3);
        assert_eq!(Complexity::default(), Complexity::Moderate);
    }

    #[test]
    fn test_phase_display_and_finality() {
        assert_eq!(WorkflowPhase::Synthesized.to_string(), "synthesized");
        assert!(WorkflowPhase::Partial.is_final());
        assert!(!WorkflowPhase::Executing.is_final());
    }

    #[test]
    fn test_brief_round_trips_through_context() {
        let brief = TaskBrief {
            local_id: "t1".into(),
            task_type: "feature".into(),
            required_capability: "rust".into(),
            complexity: Complexity::Complex,
            required: false,
        };
        let mut task = bare_task();
        task.context = Payload::encode(&brief).unwrap();
        assert_eq!(TaskBrief::of(&task), brief);
    }

    #[test]
    fn test_brief_falls_back_to_task_fields() {
        let task = bare_task();
        let brief = TaskBrief::of(&task);
        assert_eq!(brief.required_capability, "rust");
        assert_eq!(brief.task_type, "implement");
        assert!(brief.required);
    }

    #[test]
    fn test_worker_status_serialization() {
        let json = serde_json::to_string(&WorkerStatus::Working).unwrap();
        assert_eq!(json, "\"working\"");
    }
}
