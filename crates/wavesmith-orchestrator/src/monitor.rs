use crate::types::{ExecutorMetrics, ExecutorState, WorkerStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// How a single dispatch ended, from the monitor's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// Tracks state and metrics for every executor the coordinator dispatches to.
pub struct ExecutorMonitor {
    states: Arc<RwLock<BTreeMap<String, ExecutorState>>>,
}

impl ExecutorMonitor {
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    fn idle(executor_id: &str) -> ExecutorState {
        ExecutorState {
            executor_id: executor_id.to_string(),
            active_tasks: Vec::new(),
            status: WorkerStatus::Idle,
            metrics: ExecutorMetrics::default(),
        }
    }

    /// Make an executor visible before it receives any work.
    pub async fn register(&self, executor_id: &str) {
        let mut states = self.states.write().await;
        states
            .entry(executor_id.to_string())
            .or_insert_with(|| Self::idle(executor_id));
    }

    /// Mark an executor as working on a task.
    pub async fn start_task(&self, executor_id: &str, task_id: Uuid) {
        let mut states = self.states.write().await;
        let state = states
            .entry(executor_id.to_string())
            .or_insert_with(|| Self::idle(executor_id));
        state.active_tasks.push(task_id);
        state.status = WorkerStatus::Working;
        state.metrics.dispatches += 1;
    }

    /// Record the end of a dispatch and its duration.
    pub async fn finish_task(
        &self,
        executor_id: &str,
        task_id: Uuid,
        result: DispatchResult,
        duration_ms: u64,
    ) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(executor_id) {
            state.active_tasks.retain(|id| *id != task_id);
            state.metrics.duration_ms = state.metrics.duration_ms.saturating_add(duration_ms);
            match result {
                DispatchResult::Completed => state.metrics.completions += 1,
                DispatchResult::Failed => state.metrics.failures += 1,
                DispatchResult::TimedOut => state.metrics.timeouts += 1,
                DispatchResult::Cancelled => {}
            }
            state.status = if !state.active_tasks.is_empty() {
                WorkerStatus::Working
            } else if matches!(result, DispatchResult::Failed | DispatchResult::TimedOut) {
                WorkerStatus::Error
            } else {
                WorkerStatus::Idle
            };
        }
    }

    /// Get a snapshot of all executor states, ordered by id.
    pub async fn snapshot(&self) -> Vec<ExecutorState> {
        let states = self.states.read().await;
        states.values().cloned().collect()
    }

    /// Get the state of a specific executor.
    pub async fn get_state(&self, executor_id: &str) -> Option<ExecutorState> {
        let states = self.states.read().await;
        states.get(executor_id).cloned()
    }

    /// Get aggregate metrics across all executors.
    pub async fn aggregate_metrics(&self) -> ExecutorMetrics {
        let states = self.states.read().await;
        let mut total = ExecutorMetrics::default();
        for state in states.values() {
            total.dispatches += state.metrics.dispatches;
            total.completions += state.metrics.completions;
            total.failures += state.metrics.failures;
            total.timeouts += state.metrics.timeouts;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    /// Serialize the current state as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let states = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "executors": states,
            "aggregate": aggregate,
        })
    }
}

impl Default for ExecutorMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Whole milliseconds in `elapsed`, saturating at `u64::MAX`.
pub(crate) fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
