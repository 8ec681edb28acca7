use crate::task::{HistoryEntry, Task, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Human-readable reason a workflow stands where it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionReason {
    /// Some task is not terminal yet.
    Running,
    /// Every task completed.
    Completed,
    /// Every task is terminal but some failed or were cancelled.
    Partial,
    /// Nothing ran to completion; every task was cancelled.
    Aborted,
}

impl std::fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionReason::Running => write!(f, "running"),
            CompletionReason::Completed => write!(f, "completed"),
            CompletionReason::Partial => write!(f, "partial"),
            CompletionReason::Aborted => write!(f, "aborted"),
        }
    }
}

/// Derived view over a workflow's tasks. Nothing here is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub total_tasks: usize,
    /// One entry per state, zeros included; always sums to `total_tasks`.
    pub state_counts: BTreeMap<TaskState, usize>,
    pub progress_percent: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub is_complete: bool,
    pub reason: CompletionReason,
}

impl WorkflowSummary {
    /// Derive the summary for `tasks`, measuring open workflows up to `now`.
    pub fn from_tasks(workflow_id: &str, tasks: &[Task], now: DateTime<Utc>) -> Self {
        let mut state_counts: BTreeMap<TaskState, usize> =
            TaskState::ALL.into_iter().map(|s| (s, 0)).collect();
        for task in tasks {
            *state_counts.entry(task.state).or_insert(0) += 1;
        }

        let total = tasks.len();
        let count = |state: TaskState| state_counts.get(&state).copied().unwrap_or(0);
        let completed = count(TaskState::Completed);
        let failed = count(TaskState::Failed);
        let cancelled = count(TaskState::Cancelled);
        let is_complete = completed + failed + cancelled == total;

        let progress_percent = if total == 0 {
            0.0
        } else {
            completed as f64 * 100.0 / total as f64
        };

        let reason = if !is_complete {
            CompletionReason::Running
        } else if total > 0 && completed == total {
            CompletionReason::Completed
        } else if completed == 0 && failed == 0 {
            CompletionReason::Aborted
        } else {
            CompletionReason::Partial
        };

        let started_at = tasks.iter().map(|t| t.created_at).min();
        let finished_at = if is_complete {
            tasks.iter().filter_map(|t| t.completed_at).max()
        } else {
            None
        };
        let duration_ms = match started_at {
            Some(start) => (finished_at.unwrap_or(now) - start).num_milliseconds().max(0),
            None => 0,
        };

        Self {
            workflow_id: workflow_id.to_string(),
            total_tasks: total,
            state_counts,
            progress_percent,
            started_at,
            finished_at,
            duration_ms,
            is_complete,
            reason,
        }
    }

    /// Number of tasks in `state`.
    pub fn count(&self, state: TaskState) -> usize {
        self.state_counts.get(&state).copied().unwrap_or(0)
    }
}

/// Full audit snapshot of one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExport {
    pub workflow_id: String,
    pub exported_at: DateTime<Utc>,
    pub summary: WorkflowSummary,
    pub tasks: Vec<Task>,
    pub history: Vec<HistoryEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Priority;
    use chrono::Duration;
    use uuid::Uuid;
    use wavesmith_core::Payload;

    fn task_in(state: TaskState, created_at: DateTime<Utc>) -> Task {
        Task {
            id: Uuid::new_v4(),
            workflow_id: "wf".into(),
            agent: "coder".into(),
            action: "implement".into(),
            description: String::new(),
            state,
            priority: Priority::Medium,
            context: Payload::empty(),
            dependencies: Vec::new(),
            created_at,
            updated_at: created_at,
            started_at: None,
            completed_at: state
                .is_terminal()
                .then(|| created_at + Duration::seconds(10)),
            timeout_secs: 300,
            retry_count: 0,
            max_retries: 3,
            result: None,
            error: None,
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn test_counts_sum_to_total() {
        let now = Utc::now();
        let tasks = vec![
            task_in(TaskState::Completed, now),
            task_in(TaskState::Pending, now),
            task_in(TaskState::Retry, now),
        ];
        let summary = WorkflowSummary::from_tasks("wf", &tasks, now);
        assert_eq!(summary.state_counts.len(), TaskState::ALL.len());
        assert_eq!(summary.state_counts.values().sum::<usize>(), 3);
        assert_eq!(summary.reason, CompletionReason::Running);
        assert!(!summary.is_complete);
        assert!((summary.progress_percent - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_all_completed() {
        let start = Utc::now() - Duration::minutes(5);
        let tasks = vec![
            task_in(TaskState::Completed, start),
            task_in(TaskState::Completed, start),
        ];
        let summary = WorkflowSummary::from_tasks("wf", &tasks, Utc::now());
        assert_eq!(summary.reason, CompletionReason::Completed);
        assert_eq!(summary.duration_ms, 10_000);
        assert_eq!(summary.progress_percent, 100.0);
    }

    #[test]
    fn test_partial_and_aborted() {
        let now = Utc::now();
        let partial = WorkflowSummary::from_tasks(
            "wf",
            &[
                task_in(TaskState::Completed, now),
                task_in(TaskState::Failed, now),
                task_in(TaskState::Cancelled, now),
            ],
            now,
        );
        assert_eq!(partial.reason, CompletionReason::Partial);

        let aborted = WorkflowSummary::from_tasks(
            "wf",
            &[
                task_in(TaskState::Cancelled, now),
                task_in(TaskState::Cancelled, now),
            ],
            now,
        );
        assert_eq!(aborted.reason, CompletionReason::Aborted);
        assert_eq!(aborted.reason.to_string(), "aborted");
    }
}
