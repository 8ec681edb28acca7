use crate::assignment::Assignment;
use crate::executor::{ExecutionOutcome, ExecutionRequest, TaskExecutor, UpstreamResult};
use crate::graph::{DependencyGraph, Schedule};
use crate::monitor::{millis, DispatchResult, ExecutorMonitor};
use crate::retry::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wavesmith_core::{WavesmithError, WavesmithResult};
use wavesmith_store::{StateUpdate, Task, TaskState, TaskStore};

const WORKFLOW_CANCELLED: &str = "workflow cancelled";
const CANCELLED_IN_FLIGHT: &str = "cancelled while in progress";

/// Knobs for dispatching waves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Upper bound on concurrent executor calls within one wave.
    pub max_parallelism: usize,
    pub backoff: BackoffPolicy,
    /// Actor recorded on every history row the coordinator writes.
    pub actor: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            backoff: BackoffPolicy::default(),
            actor: "coordinator".to_string(),
        }
    }
}

/// Final tally of one coordinator run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Waves that dispatched at least one task.
    pub waves_run: usize,
    pub completed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    pub cancelled: Vec<Uuid>,
    /// Retry budget consumed across all tasks.
    pub total_retries: u32,
    /// Whether the workflow cancel token fired.
    pub was_cancelled: bool,
}

/// How one executor call ended.
enum Attempt {
    Succeeded(ExecutionOutcome),
    Failed(String),
    TimedOut(u64),
    Cancelled,
}

/// Drives a scheduled workflow wave by wave.
///
/// Inside a wave, tasks run concurrently behind a semaphore; the next wave
/// starts only once every task of the current one is terminal. Failures
/// retry with exponential backoff until the task's budget is spent, and a
/// task that ends `FAILED` or `CANCELLED` takes its transitive dependents
/// down with it.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    store: Arc<TaskStore>,
    executor: Arc<dyn TaskExecutor>,
    monitor: Arc<ExecutorMonitor>,
    config: CoordinatorConfig,
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<TaskStore>,
        executor: Arc<dyn TaskExecutor>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            executor,
            monitor: Arc::new(ExecutorMonitor::new()),
            config,
        }
    }

    /// Share a monitor with other components.
    pub fn with_monitor(mut self, monitor: Arc<ExecutorMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Get a reference to the monitor.
    pub fn monitor(&self) -> &Arc<ExecutorMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run every wave of `schedule`.
    ///
    /// Tasks already terminal are skipped, which is what makes a resumed
    /// workflow pick up where it stopped. Per-task failures never surface
    /// here; only store errors do.
    pub async fn execute(
        &self,
        graph: &DependencyGraph,
        schedule: &Schedule,
        assignment: &Assignment,
        cancel: &CancellationToken,
    ) -> WavesmithResult<ExecutionReport> {
        let mut report = ExecutionReport::default();
        for executor in assignment.by_executor.keys() {
            self.monitor.register(executor).await;
        }

        for (index, wave) in schedule.waves.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let runnable = self.prepare_wave(wave)?;
            if runnable.is_empty() {
                debug!(wave = index, "Nothing left to run in wave");
                continue;
            }

            info!(wave = index, tasks = runnable.len(), "Dispatching wave");
            report.waves_run += 1;
            self.run_wave(runnable, assignment, cancel).await?;
            if cancel.is_cancelled() {
                break;
            }

            self.cascade_failures(graph, wave)?;
            info!(wave = index, "Wave finished");
        }

        if cancel.is_cancelled() {
            warn!("Workflow cancelled, stopping dispatch");
            report.was_cancelled = true;
            for id in graph.ids() {
                self.cancel_task(*id, WORKFLOW_CANCELLED)?;
            }
        }

        for id in graph.ids() {
            let task = self.store.get_task(*id)?;
            report.total_retries += task.retry_count;
            match task.state {
                TaskState::Completed => report.completed.push(task.id),
                TaskState::Failed => report.failed.push(task.id),
                TaskState::Cancelled => report.cancelled.push(task.id),
                _ => {}
            }
        }
        Ok(report)
    }

    /// Tasks of a wave that still need to run, highest priority first.
    /// Tasks stuck behind an unfinished dependency are cancelled here.
    fn prepare_wave(&self, wave: &[Uuid]) -> WavesmithResult<Vec<Task>> {
        let mut runnable = Vec::with_capacity(wave.len());
        for id in wave {
            let task = self.store.get_task(*id)?;
            if task.is_terminal() {
                debug!(task_id = %task.id, state = %task.state, "Skipping terminal task");
                continue;
            }
            let mut blocker = None;
            for dep in &task.dependencies {
                let dep_task = self.store.get_task(*dep)?;
                if dep_task.state != TaskState::Completed {
                    blocker = Some(dep_task);
                    break;
                }
            }
            if let Some(dep) = blocker {
                self.cancel_task(
                    task.id,
                    &format!("cancelled: dependency {} is {}", dep.id, dep.state),
                )?;
                continue;
            }
            runnable.push(task);
        }
        runnable.sort_by_key(|t| Reverse(t.priority));
        Ok(runnable)
    }

    async fn run_wave(
        &self,
        runnable: Vec<Task>,
        assignment: &Assignment,
        cancel: &CancellationToken,
    ) -> WavesmithResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallelism.max(1)));
        let mut set = JoinSet::new();

        for task in runnable {
            let executor_id = assignment
                .executor_for(task.id)
                .map_or_else(|| task.agent.clone(), str::to_string);
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                match permit {
                    Some(_permit) => this.run_task(task, executor_id, cancel).await,
                    None => {
                        this.cancel_task(task.id, WORKFLOW_CANCELLED)?;
                        this.state_of(task.id)
                    }
                }
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Dispatch aborted by a store error");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Dispatch task panicked");
                    first_error
                        .get_or_insert(WavesmithError::Orchestrator(format!("dispatch task failed: {e}")));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drive one task through attempts until it is terminal.
    async fn run_task(
        &self,
        task: Task,
        executor_id: String,
        cancel: CancellationToken,
    ) -> WavesmithResult<TaskState> {
        let id = task.id;
        let actor = self.config.actor.as_str();

        loop {
            let current = self.store.get_task(id)?;
            if current.is_terminal() {
                return Ok(current.state);
            }
            if cancel.is_cancelled() {
                self.cancel_task(id, WORKFLOW_CANCELLED)?;
                return self.state_of(id);
            }

            match current.state {
                TaskState::Retry => {
                    self.store.update_state(
                        id,
                        StateUpdate::new(TaskState::Pending, actor)
                            .with_note("re-queued for another attempt"),
                    )?;
                }
                TaskState::InProgress => {
                    // No live call backs this state; count it as a lost attempt.
                    self.store.update_state(
                        id,
                        StateUpdate::new(TaskState::Retry, actor)
                            .with_note("resumed: attempt interrupted"),
                    )?;
                    continue;
                }
                _ => {}
            }

            if self.store.get_task(id)?.state == TaskState::Pending {
                let bound = self.store.update_state(
                    id,
                    StateUpdate::new(TaskState::Assigned, actor)
                        .with_agent(executor_id.as_str())
                        .with_note(format!("assigned to {executor_id}")),
                )?;
                if !bound {
                    return self.state_of(id);
                }
            }

            let started = self.store.update_state(
                id,
                StateUpdate::new(TaskState::InProgress, actor).with_agent(executor_id.as_str()),
            )?;
            if !started {
                self.cancel_task(id, "cancelled: dependencies not completed")?;
                return self.state_of(id);
            }

            let task = self.store.get_task(id)?;
            let request = self.build_request(&task, &executor_id, &cancel)?;
            info!(task_id = %id, executor = %executor_id, attempt = task.retry_count, "Executing task");

            self.monitor.start_task(&executor_id, id).await;
            let clock = Instant::now();
            let attempt = self.invoke(request, task.timeout(), &cancel).await;
            let elapsed_ms = millis(clock.elapsed());

            let error = match attempt {
                Attempt::Succeeded(outcome) => {
                    // Prefer the executor's own measurement when it reports one.
                    let duration_ms = if outcome.execution_time.is_zero() {
                        elapsed_ms
                    } else {
                        millis(outcome.execution_time)
                    };
                    self.monitor
                        .finish_task(&executor_id, id, DispatchResult::Completed, duration_ms)
                        .await;
                    self.store.update_state(
                        id,
                        StateUpdate::new(TaskState::Completed, actor)
                            .with_result(outcome.result)
                            .with_artifacts(outcome.artifacts),
                    )?;
                    info!(task_id = %id, executor = %executor_id, duration_ms, "Task completed");
                    return self.state_of(id);
                }
                Attempt::Cancelled => {
                    self.monitor
                        .finish_task(&executor_id, id, DispatchResult::Cancelled, elapsed_ms)
                        .await;
                    self.cancel_task(id, CANCELLED_IN_FLIGHT)?;
                    return self.state_of(id);
                }
                Attempt::TimedOut(secs) => {
                    self.monitor
                        .finish_task(&executor_id, id, DispatchResult::TimedOut, elapsed_ms)
                        .await;
                    WavesmithError::ExecutorTimeout(secs).to_string()
                }
                Attempt::Failed(message) => {
                    self.monitor
                        .finish_task(&executor_id, id, DispatchResult::Failed, elapsed_ms)
                        .await;
                    WavesmithError::ExecutorFailure(message).to_string()
                }
            };

            self.store.update_state(
                id,
                StateUpdate::new(TaskState::Retry, actor).with_error(error.as_str()),
            )?;
            let after = self.store.get_task(id)?;
            if after.state == TaskState::Failed {
                error!(
                    task_id = %id,
                    attempts = after.retry_count + 1,
                    error = %error,
                    "Task failed permanently"
                );
                return Ok(TaskState::Failed);
            }

            let delay = self.config.backoff.delay(after.retry_count.saturating_sub(1));
            warn!(
                task_id = %id,
                retry = after.retry_count,
                max_retries = after.max_retries,
                delay_ms = millis(delay),
                error = %error,
                "Task attempt failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancel_task(id, WORKFLOW_CANCELLED)?;
                    return self.state_of(id);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Call the executor with the coordinator's own timeout. The call runs on
    /// its own tokio task so a panic surfaces as a failed attempt.
    async fn invoke(
        &self,
        request: ExecutionRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Attempt {
        let executor = Arc::clone(&self.executor);
        let handle = tokio::spawn(async move { executor.execute(request).await });
        let abort = handle.abort_handle();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                abort.abort();
                Attempt::Cancelled
            }
            joined = tokio::time::timeout(timeout, handle) => match joined {
                Err(_) => {
                    abort.abort();
                    Attempt::TimedOut(timeout.as_secs())
                }
                Ok(Err(e)) => Attempt::Failed(format!("executor panicked: {e}")),
                Ok(Ok(outcome)) if outcome.success => Attempt::Succeeded(outcome),
                Ok(Ok(outcome)) => Attempt::Failed(
                    outcome
                        .error
                        .unwrap_or_else(|| "executor reported failure".to_string()),
                ),
            },
        }
    }

    fn build_request(
        &self,
        task: &Task,
        executor_id: &str,
        cancel: &CancellationToken,
    ) -> WavesmithResult<ExecutionRequest> {
        let mut upstream = Vec::with_capacity(task.dependencies.len());
        for dep in &task.dependencies {
            let dep_task = self.store.get_task(*dep)?;
            upstream.push(UpstreamResult {
                task_id: dep_task.id,
                result: dep_task.result,
                artifacts: dep_task.artifacts,
            });
        }
        Ok(ExecutionRequest {
            task_id: task.id,
            workflow_id: task.workflow_id.clone(),
            agent: executor_id.to_string(),
            action: task.action.clone(),
            description: task.description.clone(),
            context: task.context.clone(),
            timeout: task.timeout(),
            attempt: task.retry_count,
            upstream,
            cancel: cancel.child_token(),
        })
    }

    /// Cancel every non-terminal transitive dependent of the wave's failures.
    fn cascade_failures(&self, graph: &DependencyGraph, wave: &[Uuid]) -> WavesmithResult<()> {
        for id in wave {
            let task = self.store.get_task(*id)?;
            if !matches!(task.state, TaskState::Failed | TaskState::Cancelled) {
                continue;
            }
            for dependent in graph.transitive_dependents(*id) {
                let note = format!("cancelled: upstream task {id} {}", task.state);
                if self.cancel_task(dependent, &note)? {
                    warn!(task_id = %dependent, upstream = %id, "Task cancelled by upstream failure");
                }
            }
        }
        Ok(())
    }

    /// Move a task to `CANCELLED` unless it is already terminal.
    fn cancel_task(&self, id: Uuid, note: &str) -> WavesmithResult<bool> {
        if self.store.get_task(id)?.is_terminal() {
            return Ok(false);
        }
        self.store.update_state(
            id,
            StateUpdate::new(TaskState::Cancelled, self.config.actor.as_str()).with_note(note),
        )
    }

    fn state_of(&self, id: Uuid) -> WavesmithResult<TaskState> {
        Ok(self.store.get_task(id)?.state)
    }
}
