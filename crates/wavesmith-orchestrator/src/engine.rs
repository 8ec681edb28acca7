use crate::assignment::{AgentAssigner, AssignmentRequest, AssignmentWarning, CapabilityRegistry};
use crate::config::WavesmithConfig;
use crate::coordinator::{ExecutionCoordinator, ExecutionReport};
use crate::decomposition::{Decomposition, DecompositionService};
use crate::executor::TaskExecutor;
use crate::graph::{DependencyGraph, Schedule};
use crate::monitor::{millis, ExecutorMonitor};
use crate::types::{PhaseRecord, TaskBrief, TaskOutput, WorkflowPhase};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;
use wavesmith_core::{Payload, WavesmithError, WavesmithResult};
use wavesmith_store::{
    NewTask, StateUpdate, Task, TaskQuery, TaskState, TaskStore, WorkflowSummary,
};

/// A request to run one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    /// Id to file the tasks under; generated when absent.
    pub workflow_id: Option<String>,
    pub request: String,
    pub language_hint: Option<String>,
}

impl WorkflowRequest {
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            workflow_id: None,
            request: request.into(),
            language_hint: None,
        }
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_language_hint(mut self, hint: impl Into<String>) -> Self {
        self.language_hint = Some(hint.into());
        self
    }
}

/// Result of a full workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub workflow_id: String,
    pub task_type: Option<String>,
    /// Final phase: validated, partial or aborted.
    pub phase: WorkflowPhase,
    /// Every phase entered, in order.
    pub phases: Vec<PhaseRecord>,
    pub schedule: Option<Schedule>,
    pub assignment_warnings: Vec<AssignmentWarning>,
    pub report: Option<ExecutionReport>,
    pub outputs: Vec<TaskOutput>,
    /// Completed task with the most artifacts.
    pub primary_deliverable: Option<Uuid>,
    /// Completed share of the workflow's complexity weight.
    pub confidence: f64,
    pub recommendations: Vec<String>,
    pub summary: Option<WorkflowSummary>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl WorkflowOutcome {
    fn new(workflow_id: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            task_type: None,
            phase: WorkflowPhase::Received,
            phases: Vec::new(),
            schedule: None,
            assignment_warnings: Vec::new(),
            report: None,
            outputs: Vec::new(),
            primary_deliverable: None,
            confidence: 0.0,
            recommendations: Vec::new(),
            summary: None,
            error: None,
            duration_ms: 0,
        }
    }

    /// Whether the workflow validated.
    pub fn is_validated(&self) -> bool {
        self.phase == WorkflowPhase::Validated
    }

    /// Output of one task.
    pub fn output(&self, task_id: Uuid) -> Option<&TaskOutput> {
        self.outputs.iter().find(|o| o.task_id == task_id)
    }

    /// Output of the task the decomposition called `local_id`.
    pub fn output_by_local_id(&self, local_id: &str) -> Option<&TaskOutput> {
        self.outputs.iter().find(|o| o.local_id == local_id)
    }
}

/// Phase log plus the wall clock of one run.
struct Run {
    outcome: WorkflowOutcome,
    started: Instant,
}

impl Run {
    fn new(workflow_id: &str) -> Self {
        Self {
            outcome: WorkflowOutcome::new(workflow_id),
            started: Instant::now(),
        }
    }

    fn enter(&mut self, store: &TaskStore, phase: WorkflowPhase, note: Option<String>) {
        info!(
            workflow_id = %self.outcome.workflow_id,
            phase = %phase,
            note = note.as_deref().unwrap_or(""),
            "Workflow phase"
        );
        self.outcome.phase = phase;
        self.outcome.phases.push(PhaseRecord {
            phase,
            at: store.now(),
            note,
        });
    }

    fn finish(mut self) -> WorkflowOutcome {
        self.outcome.duration_ms = millis(self.started.elapsed());
        self.outcome
    }
}

/// The top-level workflow engine.
/// Implements the decompose → schedule → execute → synthesize → validate pattern.
pub struct WorkflowOrchestrator {
    store: Arc<TaskStore>,
    decomposer: Arc<dyn DecompositionService>,
    assigner: AgentAssigner,
    coordinator: ExecutionCoordinator,
    config: WavesmithConfig,
}

impl WorkflowOrchestrator {
    pub fn new(
        store: Arc<TaskStore>,
        decomposer: Arc<dyn DecompositionService>,
        registry: Arc<dyn CapabilityRegistry>,
        executor: Arc<dyn TaskExecutor>,
        config: WavesmithConfig,
    ) -> Self {
        let assigner = AgentAssigner::new(registry, config.assignment.default_executor.clone());
        let coordinator =
            ExecutionCoordinator::new(Arc::clone(&store), executor, config.coordinator_config());
        Self {
            store,
            decomposer,
            assigner,
            coordinator,
            config,
        }
    }

    /// Get a reference to the task store.
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Get a reference to the executor monitor.
    pub fn monitor(&self) -> &Arc<ExecutorMonitor> {
        self.coordinator.monitor()
    }

    /// Run a request end to end.
    ///
    /// Per-task failures never make this return `Err`; they show up in the
    /// outcome as a `Partial` phase. Graph-level problems (an empty or failed
    /// decomposition, an unknown dependency hint, a cycle) end in `Aborted`.
    /// Store failures are errors, and so is a `workflow_id` that already has
    /// tasks: continue those with [`Self::resume`].
    pub async fn run(
        &self,
        request: WorkflowRequest,
        cancel: CancellationToken,
    ) -> WavesmithResult<WorkflowOutcome> {
        let workflow_id = request
            .workflow_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if !self
            .store
            .get_tasks_by(&TaskQuery::Workflow(workflow_id.clone()))?
            .is_empty()
        {
            return Err(WavesmithError::InvalidInput(format!(
                "workflow {workflow_id} already has tasks; resume it instead"
            )));
        }
        let mut run = Run::new(&workflow_id);
        run.enter(&self.store, WorkflowPhase::Received, None);

        let decomposition = match self
            .decomposer
            .decompose(&request.request, request.language_hint.as_deref())
            .await
            .and_then(|d| d.validate().map(|()| d))
        {
            Ok(decomposition) => decomposition,
            Err(e) => return self.abort(run, &e, &[]),
        };
        run.outcome.task_type = Some(decomposition.task_type.clone());

        let specs = self.materialize(&workflow_id, &decomposition)?;
        let ids = self.store.create_tasks(specs)?;
        run.enter(
            &self.store,
            WorkflowPhase::Decomposed,
            Some(format!("{} tasks", ids.len())),
        );

        self.drive(run, &cancel).await
    }

    /// Continue a workflow from what the store holds.
    ///
    /// Tasks left in flight by a crashed process are re-queued first; tasks
    /// already terminal keep their state. The phase log starts at `Received`
    /// and goes straight to `Scheduled`.
    pub async fn resume(
        &self,
        workflow_id: &str,
        cancel: CancellationToken,
    ) -> WavesmithResult<WorkflowOutcome> {
        let tasks = self
            .store
            .get_tasks_by(&TaskQuery::Workflow(workflow_id.to_string()))?;
        let first = tasks
            .first()
            .ok_or_else(|| WavesmithError::NotFound(format!("workflow {workflow_id}")))?;

        let mut run = Run::new(workflow_id);
        run.outcome.task_type = Some(TaskBrief::of(first).task_type);
        let recovered = self
            .store
            .recover_in_flight(Some(workflow_id), &self.config.coordinator.actor)?;
        run.enter(
            &self.store,
            WorkflowPhase::Received,
            Some(format!("resumed, {} in-flight tasks re-queued", recovered.len())),
        );

        self.drive(run, &cancel).await
    }

    /// Schedule, assign, execute, synthesize and validate.
    async fn drive(&self, mut run: Run, cancel: &CancellationToken) -> WavesmithResult<WorkflowOutcome> {
        let workflow_id = run.outcome.workflow_id.clone();
        let tasks = self
            .store
            .get_tasks_by(&TaskQuery::Workflow(workflow_id.clone()))?;
        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();

        let graph = DependencyGraph::from_tasks(&tasks);
        let schedule = match graph.schedule() {
            Ok(schedule) => schedule,
            Err(e) if e.is_graph_level() => return self.abort(run, &e, &ids),
            Err(e) => return Err(e),
        };
        let timeouts: HashMap<Uuid, Duration> = tasks.iter().map(|t| (t.id, t.timeout())).collect();
        let makespan = graph.estimated_makespan(|id| timeouts.get(&id).copied().unwrap_or_default())?;
        info!(
            workflow_id = %workflow_id,
            waves = schedule.depth(),
            critical_path = schedule.critical_path.len(),
            parallelism = schedule.parallelism_score,
            worst_case_secs = makespan.as_secs(),
            "Workflow scheduled"
        );
        run.enter(
            &self.store,
            WorkflowPhase::Scheduled,
            Some(format!(
                "{} waves, critical path of {}",
                schedule.depth(),
                schedule.critical_path.len()
            )),
        );

        let requests: Vec<AssignmentRequest> = tasks
            .iter()
            .filter(|t| !t.is_terminal())
            .map(|t| {
                let brief = TaskBrief::of(t);
                AssignmentRequest {
                    task_id: t.id,
                    capability: brief.required_capability,
                    complexity: brief.complexity,
                }
            })
            .collect();
        let assignment = self.assigner.assign(&requests);
        run.outcome.assignment_warnings = assignment.warnings.clone();

        run.enter(&self.store, WorkflowPhase::Executing, None);
        let report = self
            .coordinator
            .execute(&graph, &schedule, &assignment, cancel)
            .await?;
        run.outcome.schedule = Some(schedule);

        self.synthesize(&mut run)?;
        run.enter(&self.store, WorkflowPhase::Synthesized, None);

        self.validate(&mut run, &report);
        run.outcome.report = Some(report);
        run.outcome.summary = Some(self.store.workflow_summary(&workflow_id)?);
        let final_phase = run.outcome.phase;
        info!(workflow_id = %workflow_id, phase = %final_phase, confidence = run.outcome.confidence, "Workflow finished");
        Ok(run.finish())
    }

    /// Turn atomic tasks into store records, mapping local ids to task ids.
    fn materialize(
        &self,
        workflow_id: &str,
        decomposition: &Decomposition,
    ) -> WavesmithResult<Vec<NewTask>> {
        let ids: HashMap<&str, Uuid> = decomposition
            .atomic_tasks
            .iter()
            .map(|t| (t.id.as_str(), Uuid::new_v4()))
            .collect();

        let mut specs = Vec::with_capacity(decomposition.atomic_tasks.len());
        for atomic in &decomposition.atomic_tasks {
            let id = ids.get(atomic.id.as_str()).copied().ok_or_else(|| {
                WavesmithError::Orchestrator(format!("no id minted for task '{}'", atomic.id))
            })?;
            let mut dependencies = Vec::new();
            for dep in decomposition.dependencies_of(&atomic.id) {
                let dep_id = ids.get(dep.as_str()).copied().ok_or_else(|| {
                    WavesmithError::NotFound(format!("task '{}' depends on unknown task '{dep}'", atomic.id))
                })?;
                dependencies.push(dep_id);
            }
            let brief = TaskBrief {
                local_id: atomic.id.clone(),
                task_type: decomposition.task_type.clone(),
                required_capability: atomic.required_capability.clone(),
                complexity: atomic.complexity,
                required: atomic.required,
            };
            let action = atomic
                .action
                .clone()
                .unwrap_or_else(|| decomposition.task_type.clone());
            specs.push(
                NewTask::new(workflow_id, atomic.required_capability.as_str(), action)
                    .with_id(id)
                    .with_description(atomic.description.as_str())
                    .with_dependencies(dependencies)
                    .with_priority(atomic.priority.unwrap_or_default())
                    .with_context(Payload::encode(&brief)?)
                    .with_timeout_secs(self.config.defaults.timeout_secs)
                    .with_max_retries(self.config.defaults.max_retries),
            );
        }
        Ok(specs)
    }

    /// Phase: collect per-task outputs and pick the primary deliverable.
    fn synthesize(&self, run: &mut Run) -> WavesmithResult<()> {
        let tasks = self
            .store
            .get_tasks_by(&TaskQuery::Workflow(run.outcome.workflow_id.clone()))?;
        run.outcome.outputs = tasks.iter().map(output_of).collect();

        let mut primary: Option<&TaskOutput> = None;
        for output in &run.outcome.outputs {
            if output.state != TaskState::Completed {
                continue;
            }
            if primary.map_or(true, |best| output.artifacts.len() > best.artifacts.len()) {
                primary = Some(output);
            }
        }
        run.outcome.primary_deliverable = primary.map(|o| o.task_id);
        Ok(())
    }

    /// Phase: decide between `Validated`, `Partial` and `Aborted`.
    fn validate(&self, run: &mut Run, report: &ExecutionReport) {
        let outputs = &run.outcome.outputs;
        let total: u32 = outputs.iter().map(|o| o.complexity.weight()).sum();
        let done: u32 = outputs
            .iter()
            .filter(|o| o.state == TaskState::Completed)
            .map(|o| o.complexity.weight())
            .sum();
        let confidence = if total == 0 {
            0.0
        } else {
            f64::from(done) / f64::from(total)
        };

        let mut recommendations = Vec::new();
        for output in outputs.iter().filter(|o| o.required) {
            match output.state {
                TaskState::Completed => {}
                TaskState::Failed => recommendations.push(format!(
                    "Retry task '{}' ({}): {}",
                    output.local_id,
                    output.task_id,
                    output.error.as_deref().unwrap_or("unknown error")
                )),
                state => recommendations.push(format!(
                    "Task '{}' ({}) ended {state}; re-run it once its dependencies succeed",
                    output.local_id, output.task_id
                )),
            }
        }
        let min_confidence = self.config.validation.min_confidence;
        if confidence < min_confidence {
            recommendations.push(format!(
                "Confidence {confidence:.2} is below the required {min_confidence:.2}"
            ));
        }

        run.outcome.confidence = confidence;
        let (phase, note) = if report.was_cancelled {
            run.outcome.error = Some("workflow cancelled".to_string());
            (WorkflowPhase::Aborted, Some("workflow cancelled".to_string()))
        } else if recommendations.is_empty() {
            (WorkflowPhase::Validated, None)
        } else {
            warn!(
                workflow_id = %run.outcome.workflow_id,
                issues = recommendations.len(),
                "Workflow did not validate"
            );
            (
                WorkflowPhase::Partial,
                Some(format!("{} issues", recommendations.len())),
            )
        };
        run.outcome.recommendations = recommendations;
        run.enter(&self.store, phase, note);
    }

    /// End the run as `Aborted`, cancelling whatever was already stored.
    fn abort(&self, mut run: Run, err: &WavesmithError, ids: &[Uuid]) -> WavesmithResult<WorkflowOutcome> {
        error!(workflow_id = %run.outcome.workflow_id, error = %err, "Workflow aborted");
        let note = format!("workflow aborted: {err}");
        for id in ids {
            if !self.store.get_task(*id)?.is_terminal() {
                self.store.update_state(
                    *id,
                    StateUpdate::new(TaskState::Cancelled, self.config.coordinator.actor.as_str())
                        .with_note(note.as_str()),
                )?;
            }
        }
        run.outcome.error = Some(err.to_string());
        if !ids.is_empty() {
            let tasks = self
                .store
                .get_tasks_by(&TaskQuery::Workflow(run.outcome.workflow_id.clone()))?;
            run.outcome.outputs = tasks.iter().map(output_of).collect();
            run.outcome.summary = Some(self.store.workflow_summary(&run.outcome.workflow_id)?);
        }
        run.enter(&self.store, WorkflowPhase::Aborted, Some(note));
        Ok(run.finish())
    }
}

fn output_of(task: &Task) -> TaskOutput {
    let brief = TaskBrief::of(task);
    TaskOutput {
        task_id: task.id,
        local_id: brief.local_id,
        description: task.description.clone(),
        executor: task.agent.clone(),
        state: task.state,
        complexity: brief.complexity,
        required: brief.required,
        result: task.result.clone(),
        artifacts: task.artifacts.clone(),
        error: task.error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = WorkflowRequest::new("add login")
            .with_workflow_id("wf-1")
            .with_language_hint("rust");
        assert_eq!(request.workflow_id.as_deref(), Some("wf-1"));
        assert_eq!(request.language_hint.as_deref(), Some("rust"));
    }

    #[test]
    fn test_outcome_serialization() {
        let mut outcome = WorkflowOutcome::new("wf");
        outcome.phase = WorkflowPhase::Partial;
        outcome.recommendations.push("Retry task 'a'".into());
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"partial\""));
        let parsed: WorkflowOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.recommendations.len(), 1);
        assert!(!parsed.is_validated());
    }
}
