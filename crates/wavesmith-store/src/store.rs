use crate::rows::{self, db, HistoryRow, TaskRow, SCHEMA, TASK_COLUMNS};
use crate::summary::{WorkflowExport, WorkflowSummary};
use crate::task::{HistoryEntry, NewTask, StateUpdate, Task, TaskState};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wavesmith_core::{WavesmithError, WavesmithResult};

/// Injectable time source.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Actor recorded on rows the store writes on its own behalf.
const STORE_ACTOR: &str = "task-store";

/// Selector for [`TaskStore::get_tasks_by`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskQuery {
    /// Every task of a workflow, in creation order.
    Workflow(String),
    /// Every task in a state, highest priority first, then oldest first.
    State(TaskState),
}

/// Durable task store: SQLite as the source of truth, plus a write-through
/// in-process cache.
///
/// Every mutation hits the database first and the cache second; a cache miss
/// reloads from the database, so a fresh store over the same file sees
/// everything a crashed one wrote. Updates to the same task are serialized
/// through a per-task lock.
pub struct TaskStore {
    conn: Mutex<Connection>,
    cache: RwLock<HashMap<Uuid, Task>>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    clock: Clock,
}

impl TaskStore {
    /// Open (or create) a store backed by the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> WavesmithResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db)?;
        info!(path = %path.display(), "Task store opened");
        Self::with_connection(conn)
    }

    /// Open a throwaway store that lives only as long as this value.
    pub fn open_in_memory() -> WavesmithResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db)?)
    }

    fn with_connection(conn: Connection) -> WavesmithResult<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            clock: Arc::new(Utc::now),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Current time at the precision the database keeps.
    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)().trunc_subsecs(6)
    }

    // --- Creation ---

    /// Create one task in `PENDING`. Every dependency must already exist.
    pub fn create_task(&self, spec: NewTask) -> WavesmithResult<Uuid> {
        self.create_tasks(vec![spec])?
            .into_iter()
            .next()
            .ok_or_else(|| WavesmithError::Storage("task insert returned no id".to_string()))
    }

    /// Create a batch of tasks atomically.
    ///
    /// Dependencies may point at tasks already stored or at ids pre-assigned
    /// within the same batch; anything else is [`WavesmithError::NotFound`]
    /// and nothing is written.
    pub fn create_tasks(&self, specs: Vec<NewTask>) -> WavesmithResult<Vec<Uuid>> {
        let now = self.now();
        let tasks: Vec<Task> = specs
            .into_iter()
            .map(|spec| {
                let mut dependencies = Vec::with_capacity(spec.dependencies.len());
                for dep in spec.dependencies {
                    if !dependencies.contains(&dep) {
                        dependencies.push(dep);
                    }
                }
                Task {
                    id: spec.id.unwrap_or_else(Uuid::new_v4),
                    workflow_id: spec.workflow_id,
                    agent: spec.agent,
                    action: spec.action,
                    description: spec.description,
                    state: TaskState::Pending,
                    priority: spec.priority,
                    context: spec.context,
                    dependencies,
                    created_at: now,
                    updated_at: now,
                    started_at: None,
                    completed_at: None,
                    timeout_secs: spec.timeout_secs,
                    retry_count: 0,
                    max_retries: spec.max_retries,
                    result: None,
                    error: None,
                    artifacts: Vec::new(),
                }
            })
            .collect();

        let mut batch_ids = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if !batch_ids.insert(task.id) {
                return Err(WavesmithError::InvalidInput(format!(
                    "task id {} appears twice in one batch",
                    task.id
                )));
            }
        }

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(db)?;
            for task in &tasks {
                if task_exists(&tx, task.id)? {
                    return Err(WavesmithError::InvalidInput(format!(
                        "task {} already exists",
                        task.id
                    )));
                }
                for dep in &task.dependencies {
                    if !batch_ids.contains(dep) && !task_exists(&tx, *dep)? {
                        return Err(WavesmithError::NotFound(format!(
                            "dependency {dep} of task {}",
                            task.id
                        )));
                    }
                }
            }
            for task in &tasks {
                rows::insert_task(&tx, task)?;
                rows::append_history(
                    &tx,
                    task.id,
                    None,
                    TaskState::Pending,
                    now,
                    STORE_ACTOR,
                    Some("created"),
                )?;
            }
            tx.commit().map_err(db)?;
        }

        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        let mut cache = self.cache.write();
        for task in tasks {
            debug!(task_id = %task.id, workflow_id = %task.workflow_id, "Task created");
            cache.insert(task.id, task);
        }
        Ok(ids)
    }

    // --- Reads ---

    /// Fetch a task, from the cache when warm, from the database otherwise.
    pub fn get_task(&self, id: Uuid) -> WavesmithResult<Task> {
        if let Some(task) = self.cache.read().get(&id) {
            return Ok(task.clone());
        }
        let task = self
            .load_task(id)?
            .ok_or_else(|| WavesmithError::NotFound(format!("task {id}")))?;
        // A writer may have cached a newer row since the read; keep it.
        Ok(self.cache.write().entry(id).or_insert(task).clone())
    }

    fn load_task(&self, id: Uuid) -> WavesmithResult<Option<Task>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
                TaskRow::from_row,
            )
            .optional()
            .map_err(db)?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Tasks of a workflow (creation order) or in a state (priority desc, age asc).
    pub fn get_tasks_by(&self, query: &TaskQuery) -> WavesmithResult<Vec<Task>> {
        match query {
            TaskQuery::Workflow(workflow_id) => self.select_tasks(
                "WHERE workflow_id = ?1 ORDER BY created_at ASC, rowid ASC",
                workflow_id,
            ),
            TaskQuery::State(state) => self.select_tasks(
                "WHERE state = ?1 ORDER BY priority DESC, created_at ASC, rowid ASC",
                state.as_str(),
            ),
        }
    }

    fn select_tasks(&self, clause: &str, arg: &str) -> WavesmithResult<Vec<Task>> {
        let raw: Vec<TaskRow> = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks {clause}"))
                .map_err(db)?;
            let rows = stmt
                .query_map(params![arg], TaskRow::from_row)
                .map_err(db)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db)?;
            rows
        };
        raw.into_iter().map(TaskRow::into_task).collect()
    }

    /// Every `PENDING` task whose dependencies are all `COMPLETED`, across all
    /// workflows, highest priority first.
    pub fn get_ready_tasks(&self) -> WavesmithResult<Vec<Task>> {
        let pending = self.get_tasks_by(&TaskQuery::State(TaskState::Pending))?;
        let states = self.dependency_states(&pending)?;
        Ok(pending
            .into_iter()
            .filter(|task| {
                task.dependencies
                    .iter()
                    .all(|dep| states.get(dep) == Some(&TaskState::Completed))
            })
            .collect())
    }

    fn dependency_states(&self, tasks: &[Task]) -> WavesmithResult<HashMap<Uuid, TaskState>> {
        let wanted: HashSet<Uuid> = tasks
            .iter()
            .flat_map(|t| t.dependencies.iter().copied())
            .collect();
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT state FROM tasks WHERE id = ?1")
            .map_err(db)?;
        let mut states = HashMap::with_capacity(wanted.len());
        for id in wanted {
            let state: Option<String> = stmt
                .query_row(params![id.to_string()], |row| row.get(0))
                .optional()
                .map_err(db)?;
            if let Some(state) = state {
                states.insert(id, state.parse()?);
            }
        }
        Ok(states)
    }

    /// History rows of one task, in append order.
    pub fn get_history(&self, task_id: Uuid) -> WavesmithResult<Vec<HistoryEntry>> {
        self.get_task(task_id)?;
        self.select_history(
            "WHERE task_id = ?1 ORDER BY seq ASC",
            &task_id.to_string(),
        )
    }

    fn select_history(&self, clause: &str, arg: &str) -> WavesmithResult<Vec<HistoryEntry>> {
        let raw: Vec<HistoryRow> = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT seq, task_id, previous_state, new_state, timestamp, actor, note \
                     FROM task_history {clause}"
                ))
                .map_err(db)?;
            let rows = stmt
                .query_map(params![arg], HistoryRow::from_row)
                .map_err(db)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db)?;
            rows
        };
        raw.into_iter().map(HistoryRow::into_entry).collect()
    }

    /// Derived summary of a workflow. Unknown workflows are `NotFound`.
    pub fn workflow_summary(&self, workflow_id: &str) -> WavesmithResult<WorkflowSummary> {
        let tasks = self.get_tasks_by(&TaskQuery::Workflow(workflow_id.to_string()))?;
        if tasks.is_empty() {
            return Err(WavesmithError::NotFound(format!("workflow {workflow_id}")));
        }
        Ok(WorkflowSummary::from_tasks(workflow_id, &tasks, self.now()))
    }

    /// Full audit snapshot of a workflow: tasks, every history row, summary.
    pub fn export(&self, workflow_id: &str) -> WavesmithResult<WorkflowExport> {
        let tasks = self.get_tasks_by(&TaskQuery::Workflow(workflow_id.to_string()))?;
        if tasks.is_empty() {
            return Err(WavesmithError::NotFound(format!("workflow {workflow_id}")));
        }
        let history = self.select_history(
            "WHERE task_id IN (SELECT id FROM tasks WHERE workflow_id = ?1) ORDER BY seq ASC",
            workflow_id,
        )?;
        let now = self.now();
        Ok(WorkflowExport {
            workflow_id: workflow_id.to_string(),
            exported_at: now,
            summary: WorkflowSummary::from_tasks(workflow_id, &tasks, now),
            tasks,
            history,
        })
    }

    // --- Mutation ---

    /// Apply a state change and append exactly one history row.
    ///
    /// Returns `Ok(false)` when the change is ignored: the task is already
    /// terminal, the transition is illegal, or `IN_PROGRESS` was requested
    /// before every dependency completed. The ignored call is still recorded.
    ///
    /// Requesting `RETRY` consumes one unit of retry budget; with the budget
    /// already spent the task is stored as `FAILED` instead.
    pub fn update_state(&self, id: Uuid, update: StateUpdate) -> WavesmithResult<bool> {
        let lock = self.task_lock(id);
        let _guard = lock.lock();

        let mut task = self.get_task(id)?;
        let previous = task.state;
        let now = self.now();

        if let Some(reason) = self.rejection(&task, update.state)? {
            let note = join_note(
                format!("ignored transition to {}: {reason}", update.state),
                update.note.as_deref(),
            );
            warn!(task_id = %id, from = %previous, to = %update.state, %reason, "State update ignored");
            let conn = self.conn.lock();
            rows::append_history(
                &conn,
                id,
                Some(previous),
                previous,
                now,
                &update.actor,
                Some(&note),
            )?;
            return Ok(false);
        }

        let mut target = update.state;
        let mut error = update.error;
        let mut note = update.note;

        if target == TaskState::Retry && previous != TaskState::Retry {
            if task.has_retry_budget() {
                task.retry_count += 1;
            } else {
                target = TaskState::Failed;
                let last_error = error
                    .take()
                    .or_else(|| task.error.clone())
                    .unwrap_or_else(|| "unknown error".to_string());
                error = Some(
                    WavesmithError::RetriesExhausted {
                        attempts: task.retry_count + 1,
                        last_error,
                    }
                    .to_string(),
                );
                note = Some(join_note(
                    "retry budget exhausted".to_string(),
                    note.as_deref(),
                ));
            }
        }

        task.state = target;
        task.updated_at = now;
        if let Some(agent) = update.agent {
            task.agent = agent;
        }
        if target == TaskState::InProgress && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if target.is_terminal() {
            task.completed_at = Some(now);
        }
        if let Some(result) = update.result {
            task.result = Some(result);
        }
        if let Some(artifacts) = update.artifacts {
            task.artifacts = artifacts;
        }
        if error.is_some() {
            task.error = error;
        } else if target == TaskState::Completed {
            task.error = None;
        }

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(db)?;
            rows::update_task(&tx, &task)?;
            rows::append_history(
                &tx,
                id,
                Some(previous),
                target,
                now,
                &update.actor,
                note.as_deref(),
            )?;
            tx.commit().map_err(db)?;
        }

        debug!(task_id = %id, from = %previous, to = %target, actor = %update.actor, "Task state updated");
        self.cache.write().insert(id, task);
        Ok(true)
    }

    /// Why `task` may not move to `next`, if it may not.
    fn rejection(&self, task: &Task, next: TaskState) -> WavesmithResult<Option<String>> {
        if task.state.is_terminal() {
            return Ok(Some(format!("task already {}", task.state)));
        }
        if !task.state.can_transition_to(next) {
            return Ok(Some(format!("illegal transition from {}", task.state)));
        }
        if next == TaskState::InProgress && task.state != TaskState::InProgress {
            let mut unmet = Vec::new();
            for dep in &task.dependencies {
                match self.get_task(*dep) {
                    Ok(dep_task) if dep_task.state == TaskState::Completed => {}
                    Ok(_) | Err(WavesmithError::NotFound(_)) => unmet.push(dep.to_string()),
                    Err(e) => return Err(e),
                }
            }
            if !unmet.is_empty() {
                return Ok(Some(format!(
                    "dependencies not completed: {}",
                    unmet.join(", ")
                )));
            }
        }
        Ok(None)
    }

    fn task_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Re-queue work a crashed coordinator left behind.
    ///
    /// `IN_PROGRESS` tasks have no live executor handle any more: they move
    /// to `RETRY` (consuming budget, so an exhausted task becomes `FAILED`).
    /// `ASSIGNED` tasks never started and go back to `PENDING`. Pass a
    /// workflow id to limit recovery to one workflow.
    pub fn recover_in_flight(
        &self,
        workflow_id: Option<&str>,
        actor: &str,
    ) -> WavesmithResult<Vec<Uuid>> {
        let mut recovered = Vec::new();
        let plan = [
            (
                TaskState::InProgress,
                TaskState::Retry,
                "resumed: no live executor handle after restart",
            ),
            (
                TaskState::Assigned,
                TaskState::Pending,
                "resumed: assignment dropped after restart",
            ),
        ];
        for (found, target, note) in plan {
            for task in self.get_tasks_by(&TaskQuery::State(found))? {
                if workflow_id.is_some_and(|wf| wf != task.workflow_id) {
                    continue;
                }
                self.update_state(task.id, StateUpdate::new(target, actor).with_note(note))?;
                recovered.push(task.id);
            }
        }
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "Recovered in-flight tasks after restart");
        }
        Ok(recovered)
    }

    // --- Retention ---

    /// Hard-delete tasks created more than `retention_days` ago, together
    /// with their history. Returns how many tasks were removed.
    ///
    /// A task some surviving task depends on is kept regardless of age, so a
    /// dependency list never points at a deleted row.
    pub fn cleanup(&self, retention_days: u32) -> WavesmithResult<usize> {
        let cutoff = rows::to_micros(self.now() - Duration::days(i64::from(retention_days)));
        let removed: Vec<Uuid> = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(db)?;
            let all: Vec<(String, i64, String)> = {
                let mut stmt = tx
                    .prepare("SELECT id, created_at, dependencies FROM tasks")
                    .map_err(db)?;
                let all = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                    .map_err(db)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(db)?;
                all
            };

            let mut deps: HashMap<String, Vec<String>> = HashMap::with_capacity(all.len());
            let mut expired: HashSet<String> = HashSet::new();
            for (id, created_at, dependencies) in all {
                deps.insert(id.clone(), serde_json::from_str(&dependencies)?);
                if created_at < cutoff {
                    expired.insert(id);
                }
            }

            // Survivors pin their dependencies, transitively.
            let mut pinned: Vec<String> = deps
                .iter()
                .filter(|(id, _)| !expired.contains(*id))
                .flat_map(|(_, d)| d.iter().cloned())
                .collect();
            while let Some(id) = pinned.pop() {
                if expired.remove(&id) {
                    if let Some(d) = deps.get(&id) {
                        pinned.extend(d.iter().cloned());
                    }
                }
            }

            for id in &expired {
                tx.execute("DELETE FROM task_history WHERE task_id = ?1", params![id])
                    .map_err(db)?;
                tx.execute("DELETE FROM tasks WHERE id = ?1", params![id])
                    .map_err(db)?;
            }
            tx.commit().map_err(db)?;
            expired.iter().filter_map(|id| Uuid::parse_str(id).ok()).collect()
        };

        {
            let mut cache = self.cache.write();
            let mut locks = self.locks.lock();
            for id in &removed {
                cache.remove(id);
                locks.remove(id);
            }
        }
        info!(removed = removed.len(), retention_days, "Task store cleanup finished");
        Ok(removed.len())
    }

    // --- Cache control ---

    /// Drop one task from the cache; the next read reloads it.
    pub fn evict(&self, id: Uuid) {
        self.cache.write().remove(&id);
    }

    /// Drop the whole cache.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    /// Number of cached tasks.
    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }
}

fn task_exists(conn: &Connection, id: Uuid) -> WavesmithResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM tasks WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db)?;
    Ok(found.is_some())
}

fn join_note(head: String, tail: Option<&str>) -> String {
    match tail {
        Some(tail) if !tail.is_empty() => format!("{head}; {tail}"),
        _ => head,
    }
}
