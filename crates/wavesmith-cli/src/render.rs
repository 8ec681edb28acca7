//! Plain-text rendering of store records.

use chrono::{DateTime, Utc};
use std::fmt::Write;
use wavesmith_store::{HistoryEntry, Task, TaskState, WorkflowSummary};

fn stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// One line per task, for listings.
pub fn task_line(task: &Task) -> String {
    let description = if task.description.is_empty() {
        task.action.as_str()
    } else {
        task.description.as_str()
    };
    format!(
        "{}  {:<11}  {:<8}  {:<16}  {}",
        task.id, task.state, task.priority, task.agent, description
    )
}

/// Every field of a task.
pub fn task_detail(task: &Task) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Task {}", task.id);
    let _ = writeln!(out, "  workflow:     {}", task.workflow_id);
    let _ = writeln!(out, "  state:        {}", task.state);
    let _ = writeln!(out, "  priority:     {}", task.priority);
    let _ = writeln!(out, "  agent:        {}", task.agent);
    let _ = writeln!(out, "  action:       {}", task.action);
    if !task.description.is_empty() {
        let _ = writeln!(out, "  description:  {}", task.description);
    }
    let _ = writeln!(
        out,
        "  retries:      {}/{}",
        task.retry_count, task.max_retries
    );
    let _ = writeln!(out, "  timeout:      {}s", task.timeout_secs);
    let _ = writeln!(out, "  created:      {}", stamp(task.created_at));
    if let Some(started) = task.started_at {
        let _ = writeln!(out, "  started:      {}", stamp(started));
    }
    if let Some(completed) = task.completed_at {
        let _ = writeln!(out, "  completed:    {}", stamp(completed));
    }
    if !task.dependencies.is_empty() {
        let _ = writeln!(out, "  depends on:");
        for dep in &task.dependencies {
            let _ = writeln!(out, "    {dep}");
        }
    }
    if !task.artifacts.is_empty() {
        let _ = writeln!(out, "  artifacts:");
        for artifact in &task.artifacts {
            let _ = writeln!(out, "    {artifact}");
        }
    }
    if let Some(error) = &task.error {
        let _ = writeln!(out, "  error:        {error}");
    }
    if let Some(result) = &task.result {
        let _ = writeln!(out, "  result:       {}", result.as_value());
    }
    out
}

/// One line per history row, oldest first.
pub fn history_lines(entries: &[HistoryEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let from = entry
                .previous_state
                .map_or_else(|| "-".to_string(), |s| s.to_string());
            let mut line = format!(
                "{:>4}  {}  {:>11} -> {:<11}  {}",
                entry.seq,
                stamp(entry.timestamp),
                from,
                entry.new_state,
                entry.actor
            );
            if let Some(note) = &entry.note {
                let _ = write!(line, "  ({note})");
            }
            line
        })
        .collect()
}

/// Counts per state plus the completion reason.
pub fn summary_text(summary: &WorkflowSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Workflow {}", summary.workflow_id);
    let _ = writeln!(
        out,
        "  {} tasks, {:.1}% completed, {}",
        summary.total_tasks, summary.progress_percent, summary.reason
    );
    for state in TaskState::ALL {
        let count = summary.count(state);
        if count > 0 {
            let _ = writeln!(out, "  {state:<11} {count}");
        }
    }
    if let Some(started) = summary.started_at {
        let _ = writeln!(out, "  started:  {}", stamp(started));
    }
    if let Some(finished) = summary.finished_at {
        let _ = writeln!(out, "  finished: {}", stamp(finished));
    }
    let _ = writeln!(out, "  duration: {}ms", summary.duration_ms);
    out
}
