//! SQLite schema and row conversion for tasks and their history.

use crate::task::{HistoryEntry, Priority, Task, TaskState};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;
use wavesmith_core::{Payload, WavesmithError, WavesmithResult};

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id            TEXT PRIMARY KEY,
    workflow_id   TEXT NOT NULL,
    agent         TEXT NOT NULL,
    action        TEXT NOT NULL,
    description   TEXT NOT NULL,
    state         TEXT NOT NULL,
    priority      INTEGER NOT NULL,
    context       TEXT NOT NULL,
    dependencies  TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    started_at    INTEGER,
    completed_at  INTEGER,
    timeout_secs  INTEGER NOT NULL,
    retry_count   INTEGER NOT NULL,
    max_retries   INTEGER NOT NULL,
    result        TEXT,
    error         TEXT,
    artifacts     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_workflow ON tasks(workflow_id);
CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);

CREATE TABLE IF NOT EXISTS task_history (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id         TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    previous_state  TEXT,
    new_state       TEXT NOT NULL,
    timestamp       INTEGER NOT NULL,
    actor           TEXT NOT NULL,
    note            TEXT
);
CREATE INDEX IF NOT EXISTS idx_history_task ON task_history(task_id);
";

pub(crate) const TASK_COLUMNS: &str = "id, workflow_id, agent, action, description, state, \
     priority, context, dependencies, created_at, updated_at, started_at, completed_at, \
     timeout_secs, retry_count, max_retries, result, error, artifacts";

pub(crate) fn db(err: rusqlite::Error) -> WavesmithError {
    WavesmithError::Storage(err.to_string())
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> WavesmithError {
    WavesmithError::Storage(format!("corrupt {what}: {detail}"))
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> WavesmithResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| corrupt("timestamp", micros))
}

fn parse_id(raw: &str) -> WavesmithResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| corrupt("task id", format!("'{raw}': {e}")))
}

/// A `tasks` row as plain column values.
pub(crate) struct TaskRow {
    id: String,
    workflow_id: String,
    agent: String,
    action: String,
    description: String,
    state: String,
    priority: i64,
    context: String,
    dependencies: String,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    timeout_secs: i64,
    retry_count: i64,
    max_retries: i64,
    result: Option<String>,
    error: Option<String>,
    artifacts: String,
}

impl TaskRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            workflow_id: row.get("workflow_id")?,
            agent: row.get("agent")?,
            action: row.get("action")?,
            description: row.get("description")?,
            state: row.get("state")?,
            priority: row.get("priority")?,
            context: row.get("context")?,
            dependencies: row.get("dependencies")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            timeout_secs: row.get("timeout_secs")?,
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            result: row.get("result")?,
            error: row.get("error")?,
            artifacts: row.get("artifacts")?,
        })
    }

    pub(crate) fn into_task(self) -> WavesmithResult<Task> {
        let dependencies: Vec<String> = serde_json::from_str(&self.dependencies)?;
        Ok(Task {
            id: parse_id(&self.id)?,
            workflow_id: self.workflow_id,
            agent: self.agent,
            action: self.action,
            description: self.description,
            state: self.state.parse()?,
            priority: Priority::from_rank(self.priority)
                .ok_or_else(|| corrupt("priority", self.priority))?,
            context: Payload::from_json(&self.context)?,
            dependencies: dependencies
                .iter()
                .map(|d| parse_id(d))
                .collect::<WavesmithResult<_>>()?,
            created_at: from_micros(self.created_at)?,
            updated_at: from_micros(self.updated_at)?,
            started_at: self.started_at.map(from_micros).transpose()?,
            completed_at: self.completed_at.map(from_micros).transpose()?,
            timeout_secs: u64::try_from(self.timeout_secs)
                .map_err(|e| corrupt("timeout", e))?,
            retry_count: u32::try_from(self.retry_count).map_err(|e| corrupt("retry_count", e))?,
            max_retries: u32::try_from(self.max_retries).map_err(|e| corrupt("max_retries", e))?,
            result: self.result.as_deref().map(Payload::from_json).transpose()?,
            error: self.error,
            artifacts: serde_json::from_str(&self.artifacts)?,
        })
    }
}

/// A `task_history` row as plain column values.
pub(crate) struct HistoryRow {
    seq: i64,
    task_id: String,
    previous_state: Option<String>,
    new_state: String,
    timestamp: i64,
    actor: String,
    note: Option<String>,
}

impl HistoryRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get("seq")?,
            task_id: row.get("task_id")?,
            previous_state: row.get("previous_state")?,
            new_state: row.get("new_state")?,
            timestamp: row.get("timestamp")?,
            actor: row.get("actor")?,
            note: row.get("note")?,
        })
    }

    pub(crate) fn into_entry(self) -> WavesmithResult<HistoryEntry> {
        Ok(HistoryEntry {
            seq: self.seq,
            task_id: parse_id(&self.task_id)?,
            previous_state: self
                .previous_state
                .as_deref()
                .map(str::parse::<TaskState>)
                .transpose()?,
            new_state: self.new_state.parse()?,
            timestamp: from_micros(self.timestamp)?,
            actor: self.actor,
            note: self.note,
        })
    }
}

fn dependency_json(task: &Task) -> WavesmithResult<String> {
    let ids: Vec<String> = task.dependencies.iter().map(Uuid::to_string).collect();
    Ok(serde_json::to_string(&ids)?)
}

pub(crate) fn insert_task(conn: &Connection, task: &Task) -> WavesmithResult<()> {
    let timeout_secs = i64::try_from(task.timeout_secs).map_err(|_| {
        WavesmithError::InvalidInput(format!(
            "timeout of {}s for task {} is out of range",
            task.timeout_secs, task.id
        ))
    })?;
    conn.execute(
        &format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
        ),
        params![
            task.id.to_string(),
            task.workflow_id,
            task.agent,
            task.action,
            task.description,
            task.state.as_str(),
            task.priority.rank(),
            task.context.to_json()?,
            dependency_json(task)?,
            to_micros(task.created_at),
            to_micros(task.updated_at),
            task.started_at.map(to_micros),
            task.completed_at.map(to_micros),
            timeout_secs,
            i64::from(task.retry_count),
            i64::from(task.max_retries),
            task.result.as_ref().map(Payload::to_json).transpose()?,
            task.error,
            serde_json::to_string(&task.artifacts)?,
        ],
    )
    .map_err(db)?;
    Ok(())
}

pub(crate) fn update_task(conn: &Connection, task: &Task) -> WavesmithResult<()> {
    let changed = conn
        .execute(
            "UPDATE tasks SET agent = ?2, state = ?3, updated_at = ?4, started_at = ?5, \
             completed_at = ?6, retry_count = ?7, result = ?8, error = ?9, artifacts = ?10 \
             WHERE id = ?1",
            params![
                task.id.to_string(),
                task.agent,
                task.state.as_str(),
                to_micros(task.updated_at),
                task.started_at.map(to_micros),
                task.completed_at.map(to_micros),
                i64::from(task.retry_count),
                task.result.as_ref().map(Payload::to_json).transpose()?,
                task.error,
                serde_json::to_string(&task.artifacts)?,
            ],
        )
        .map_err(db)?;
    if changed == 0 {
        return Err(WavesmithError::NotFound(format!("task {}", task.id)));
    }
    Ok(())
}

pub(crate) fn append_history(
    conn: &Connection,
    task_id: Uuid,
    previous_state: Option<TaskState>,
    new_state: TaskState,
    timestamp: DateTime<Utc>,
    actor: &str,
    note: Option<&str>,
) -> WavesmithResult<()> {
    conn.execute(
        "INSERT INTO task_history (task_id, previous_state, new_state, timestamp, actor, note) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            task_id.to_string(),
            previous_state.map(TaskState::as_str),
            new_state.as_str(),
            to_micros(timestamp),
            actor,
            note,
        ],
    )
    .map_err(db)?;
    Ok(())
}
