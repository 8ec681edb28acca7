use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;
use wavesmith_core::{Payload, WavesmithError};

/// Default per-attempt executor timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
/// Default retry budget.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, waiting for its dependencies and a dispatch slot.
    Pending,
    /// Bound to an executor, not yet started.
    Assigned,
    /// The executor call is in flight.
    InProgress,
    /// Finished successfully. Terminal.
    Completed,
    /// An attempt failed; the task will be re-queued.
    Retry,
    /// Failed for good. Terminal.
    Failed,
    /// Never ran to completion because of an upstream failure or a cancel. Terminal.
    Cancelled,
}

impl TaskState {
    /// Every state, in lifecycle order.
    pub const ALL: [TaskState; 7] = [
        TaskState::Pending,
        TaskState::Assigned,
        TaskState::InProgress,
        TaskState::Completed,
        TaskState::Retry,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    /// Whether the state is final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Whether a task may move from `self` to `next`.
    ///
    /// Re-entering the current state is allowed (a recorded no-op); terminal
    /// states accept nothing.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self == next {
            return true;
        }
        match self {
            TaskState::Pending => matches!(
                next,
                TaskState::Assigned | TaskState::Cancelled | TaskState::Failed
            ),
            TaskState::Assigned => matches!(
                next,
                TaskState::InProgress
                    | TaskState::Pending
                    | TaskState::Cancelled
                    | TaskState::Failed
            ),
            TaskState::InProgress => matches!(
                next,
                TaskState::Completed
                    | TaskState::Retry
                    | TaskState::Failed
                    | TaskState::Cancelled
            ),
            TaskState::Retry => matches!(
                next,
                TaskState::Pending | TaskState::Failed | TaskState::Cancelled
            ),
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled => false,
        }
    }

    /// Stable storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Assigned => "assigned",
            TaskState::InProgress => "in_progress",
            TaskState::Completed => "completed",
            TaskState::Retry => "retry",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = WavesmithError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| WavesmithError::InvalidInput(format!("unknown task state '{s}'")))
    }
}

/// Scheduling priority. Ordered: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// The default.
    #[default]
    Medium,
    /// Should run ahead of ordinary work.
    High,
    /// Runs first.
    Critical,
}

impl Priority {
    /// Numeric rank used for storage and ordering.
    pub fn rank(self) -> i64 {
        match self {
            Priority::Low => 1,
            Priority::Medium => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }

    /// Inverse of [`Priority::rank`].
    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            1 => Some(Priority::Low),
            2 => Some(Priority::Medium),
            3 => Some(Priority::High),
            4 => Some(Priority::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        })
    }
}

/// A stateful unit of work owned by a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub workflow_id: String,
    /// Required capability until assignment, then the bound executor id.
    pub agent: String,
    pub action: String,
    pub description: String,
    pub state: TaskState,
    pub priority: Priority,
    pub context: Payload,
    pub dependencies: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_secs: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<Payload>,
    pub error: Option<String>,
    pub artifacts: Vec<String>,
}

impl Task {
    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether the task reached a final state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether another failed attempt can still be retried.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether the task is pending and every dependency is in `completed_ids`.
    pub fn is_ready(&self, completed_ids: &[Uuid]) -> bool {
        self.state == TaskState::Pending
            && self
                .dependencies
                .iter()
                .all(|dep| completed_ids.contains(dep))
    }
}

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Pre-assigned id, so a batch can reference its own members.
    pub id: Option<Uuid>,
    pub workflow_id: String,
    pub agent: String,
    pub action: String,
    pub description: String,
    pub dependencies: Vec<Uuid>,
    pub priority: Priority,
    pub context: Payload,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl NewTask {
    /// Start a task description with defaults for everything optional.
    pub fn new(
        workflow_id: impl Into<String>,
        agent: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            workflow_id: workflow_id.into(),
            agent: agent.into(),
            action: action.into(),
            description: String::new(),
            dependencies: Vec::new(),
            priority: Priority::default(),
            context: Payload::empty(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: Payload) -> Self {
        self.context = context;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A requested state change, applied by [`TaskStore::update_state`](crate::TaskStore::update_state).
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub state: TaskState,
    pub actor: String,
    /// Rebinds the task's agent, e.g. to the executor chosen at assignment.
    pub agent: Option<String>,
    pub result: Option<Payload>,
    pub error: Option<String>,
    pub artifacts: Option<Vec<String>>,
    pub note: Option<String>,
}

impl StateUpdate {
    pub fn new(state: TaskState, actor: impl Into<String>) -> Self {
        Self {
            state,
            actor: actor.into(),
            agent: None,
            result: None,
            error: None,
            artifacts: None,
            note: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_result(mut self, result: Payload) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// One row of the append-only task history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Append sequence, monotonically increasing across the store.
    pub seq: i64,
    pub task_id: Uuid,
    pub previous_state: Option<TaskState>,
    pub new_state: TaskState,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub note: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<TaskState> = TaskState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![TaskState::Completed, TaskState::Failed, TaskState::Cancelled]
        );
    }

    #[test]
    fn test_lifecycle_transitions() {
        assert!(TaskState::Pending.can_transition_to(TaskState::Assigned));
        assert!(TaskState::Assigned.can_transition_to(TaskState::InProgress));
        assert!(TaskState::InProgress.can_transition_to(TaskState::Retry));
        assert!(TaskState::Retry.can_transition_to(TaskState::Pending));
        assert!(TaskState::Pending.can_transition_to(TaskState::Pending));

        assert!(!TaskState::Pending.can_transition_to(TaskState::Completed));
        assert!(!TaskState::Pending.can_transition_to(TaskState::InProgress));
        assert!(!TaskState::Completed.can_transition_to(TaskState::Completed));
        assert!(!TaskState::Failed.can_transition_to(TaskState::Pending));
    }

    #[test]
    fn test_state_parse_round_trip() {
        for state in TaskState::ALL {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert_eq!("IN-PROGRESS".parse::<TaskState>().unwrap(), TaskState::InProgress);
        assert!("running".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::from_rank(Priority::High.rank()), Some(Priority::High));
        assert_eq!(Priority::from_rank(9), None);
    }

    #[test]
    fn test_new_task_defaults() {
        let spec = NewTask::new("wf", "coder", "implement");
        assert_eq!(spec.timeout_secs, 300);
        assert_eq!(spec.max_retries, 3);
        assert_eq!(spec.priority, Priority::Medium);
        assert!(spec.context.is_empty());
        assert!(spec.id.is_none());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&TaskState::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: TaskState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskState::InProgress);
    }
}
