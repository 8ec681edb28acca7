#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;
use wavesmith_store::{
    CompletionReason, NewTask, StateUpdate, TaskQuery, TaskState, TaskStore,
};

/// Helper: a store on disk in a temp directory.
fn temp_store() -> (TaskStore, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let store = TaskStore::open(tmp.path().join("db").join("tasks.db")).unwrap();
    (store, tmp)
}

/// Helper: a store whose clock the test moves by hand.
fn store_with_clock(path: &std::path::Path) -> (TaskStore, Arc<Mutex<DateTime<Utc>>>) {
    let now = Arc::new(Mutex::new(Utc::now()));
    let clock = Arc::clone(&now);
    let store = TaskStore::open(path)
        .unwrap()
        .with_clock(Arc::new(move || *clock.lock()));
    (store, now)
}

fn update(store: &TaskStore, id: Uuid, state: TaskState) -> bool {
    store
        .update_state(id, StateUpdate::new(state, "integration"))
        .unwrap()
}

#[test]
fn test_scenario_ready_after_root_completes() {
    let (store, _tmp) = temp_store();
    let a = store.create_task(NewTask::new("wf", "coder", "a")).unwrap();
    let b = store
        .create_task(NewTask::new("wf", "coder", "b").with_dependencies(vec![a]))
        .unwrap();
    let c = store
        .create_task(NewTask::new("wf", "coder", "c").with_dependencies(vec![a]))
        .unwrap();

    update(&store, a, TaskState::Assigned);
    update(&store, a, TaskState::InProgress);
    update(&store, a, TaskState::Completed);

    let ready: Vec<Uuid> = store
        .get_ready_tasks()
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ready, vec![b, c]);
}

#[test]
fn test_scenario_retry_twice_then_complete() {
    let (store, _tmp) = temp_store();
    let id = store
        .create_task(NewTask::new("wf", "coder", "flaky").with_max_retries(2))
        .unwrap();

    for _ in 0..2 {
        update(&store, id, TaskState::Assigned);
        update(&store, id, TaskState::InProgress);
        assert!(store
            .update_state(
                id,
                StateUpdate::new(TaskState::Retry, "integration").with_error("boom")
            )
            .unwrap());
        update(&store, id, TaskState::Pending);
    }
    update(&store, id, TaskState::Assigned);
    update(&store, id, TaskState::InProgress);
    update(&store, id, TaskState::Completed);

    let task = store.get_task(id).unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.retry_count, 2);
    assert!(task.error.is_none());

    let history = store.get_history(id).unwrap();
    let count = |s: TaskState| history.iter().filter(|h| h.new_state == s).count();
    assert!(count(TaskState::InProgress) >= 1);
    assert_eq!(count(TaskState::Retry), 2);
    assert_eq!(count(TaskState::Completed), 1);
}

#[test]
fn test_exhausted_task_ignores_further_updates() {
    let (store, _tmp) = temp_store();
    let id = store
        .create_task(NewTask::new("wf", "coder", "doomed").with_max_retries(0))
        .unwrap();
    update(&store, id, TaskState::Assigned);
    update(&store, id, TaskState::InProgress);
    update(&store, id, TaskState::Retry);

    let task = store.get_task(id).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.retry_count <= task.max_retries);

    assert!(!update(&store, id, TaskState::Pending));
    assert!(!update(&store, id, TaskState::InProgress));
    assert_eq!(store.get_task(id).unwrap().state, TaskState::Failed);
}

#[test]
fn test_scenario_cleanup_removes_only_old_tasks() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, now) = store_with_clock(&tmp.path().join("tasks.db"));
    let real_now = *now.lock();

    *now.lock() = real_now - Duration::days(40);
    let old = store.create_task(NewTask::new("wf-old", "coder", "x")).unwrap();
    update(&store, old, TaskState::Assigned);

    *now.lock() = real_now - Duration::days(1);
    let recent = store.create_task(NewTask::new("wf-new", "coder", "y")).unwrap();

    *now.lock() = real_now;
    assert_eq!(store.cleanup(30).unwrap(), 1);

    assert!(store.get_task(old).is_err());
    assert!(store.get_history(old).is_err());
    assert!(store.get_task(recent).is_ok());
    assert_eq!(store.get_history(recent).unwrap().len(), 1);

    // Nothing left to remove.
    assert_eq!(store.cleanup(30).unwrap(), 0);
}

#[test]
fn test_cleanup_keeps_old_tasks_that_live_tasks_depend_on() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, now) = store_with_clock(&tmp.path().join("tasks.db"));
    let real_now = *now.lock();

    *now.lock() = real_now - Duration::days(50);
    let root = store.create_task(NewTask::new("wf", "coder", "root")).unwrap();
    *now.lock() = real_now - Duration::days(40);
    let a = store
        .create_task(NewTask::new("wf", "coder", "a").with_dependencies(vec![root]))
        .unwrap();
    let stale = store.create_task(NewTask::new("wf-old", "coder", "z")).unwrap();
    for id in [root, a] {
        update(&store, id, TaskState::Assigned);
        update(&store, id, TaskState::InProgress);
        update(&store, id, TaskState::Completed);
    }

    *now.lock() = real_now - Duration::days(1);
    let b = store
        .create_task(NewTask::new("wf", "reviewer", "b").with_dependencies(vec![a]))
        .unwrap();

    *now.lock() = real_now;
    assert_eq!(store.cleanup(30).unwrap(), 1);
    assert!(store.get_task(stale).is_err());
    assert_eq!(store.get_task(a).unwrap().state, TaskState::Completed);
    assert_eq!(store.get_task(root).unwrap().state, TaskState::Completed);

    let ready: Vec<Uuid> = store.get_ready_tasks().unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ready, vec![b]);
    update(&store, b, TaskState::Assigned);
    assert!(update(&store, b, TaskState::InProgress));

    // Once nothing depends on them any more, the old tasks go too.
    update(&store, b, TaskState::Completed);
    *now.lock() = real_now + Duration::days(40);
    assert_eq!(store.cleanup(30).unwrap(), 3);
    assert!(store.get_task(root).is_err());
}

#[test]
fn test_cache_misses_never_roll_back_updates() {
    let (store, _tmp) = temp_store();
    let store = Arc::new(store);
    let rounds = 40;
    let id = store
        .create_task(NewTask::new("wf", "coder", "x").with_max_retries(rounds))
        .unwrap();
    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let reader = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            while !done.load(std::sync::atomic::Ordering::SeqCst) {
                store.evict(id);
                store.get_task(id).unwrap();
            }
        })
    };

    for _ in 0..rounds {
        assert!(update(&store, id, TaskState::Assigned));
        assert!(update(&store, id, TaskState::InProgress));
        assert!(update(&store, id, TaskState::Retry));
        assert!(update(&store, id, TaskState::Pending));
    }
    done.store(true, std::sync::atomic::Ordering::SeqCst);
    reader.join().unwrap();

    let cached = store.get_task(id).unwrap();
    store.clear_cache();
    let persisted = store.get_task(id).unwrap();
    assert_eq!(persisted.retry_count, rounds);
    assert_eq!(persisted.state, TaskState::Pending);
    assert_eq!(cached, persisted);
}

#[test]
fn test_reopen_reads_everything_back() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("tasks.db");
    let (a, b) = {
        let store = TaskStore::open(&path).unwrap();
        let a = store.create_task(NewTask::new("wf", "coder", "a")).unwrap();
        let b = store
            .create_task(NewTask::new("wf", "reviewer", "b").with_dependencies(vec![a]))
            .unwrap();
        update(&store, a, TaskState::Assigned);
        update(&store, a, TaskState::InProgress);
        (a, b)
    };

    let store = TaskStore::open(&path).unwrap();
    assert_eq!(store.cached_len(), 0);
    let task_a = store.get_task(a).unwrap();
    assert_eq!(task_a.state, TaskState::InProgress);
    assert!(task_a.started_at.is_some());
    assert_eq!(store.get_task(b).unwrap().dependencies, vec![a]);
    assert_eq!(store.get_history(a).unwrap().len(), 3);

    let recovered = store.recover_in_flight(None, "restart").unwrap();
    assert_eq!(recovered, vec![a]);
    assert_eq!(store.get_task(a).unwrap().state, TaskState::Retry);
}

#[test]
fn test_concurrent_updates_keep_one_row_each() {
    let (store, _tmp) = temp_store();
    let store = Arc::new(store);
    let id = store.create_task(NewTask::new("wf", "coder", "x")).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let state = if i % 2 == 0 {
                    TaskState::Assigned
                } else {
                    TaskState::Pending
                };
                store
                    .update_state(id, StateUpdate::new(state, format!("worker-{i}")))
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let history = store.get_history(id).unwrap();
    assert_eq!(history.len(), 1 + 8);
    assert!(history.windows(2).all(|w| w[0].seq < w[1].seq));
    let last = history.last().unwrap();
    assert_eq!(store.get_task(id).unwrap().state, last.new_state);
}

#[test]
fn test_summary_reports_completion_reason() {
    let (store, _tmp) = temp_store();
    let a = store.create_task(NewTask::new("wf", "coder", "a")).unwrap();
    let b = store.create_task(NewTask::new("wf", "coder", "b")).unwrap();

    assert_eq!(
        store.workflow_summary("wf").unwrap().reason,
        CompletionReason::Running
    );

    update(&store, a, TaskState::Assigned);
    update(&store, a, TaskState::InProgress);
    update(&store, a, TaskState::Completed);
    update(&store, b, TaskState::Cancelled);

    let summary = store.workflow_summary("wf").unwrap();
    assert!(summary.is_complete);
    assert_eq!(summary.reason, CompletionReason::Partial);
    assert_eq!(summary.state_counts.values().sum::<usize>(), summary.total_tasks);
    assert!(summary.finished_at.is_some());

    let listed = store
        .get_tasks_by(&TaskQuery::State(TaskState::Cancelled))
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, b);
}

#[test]
fn test_export_serializes_to_json() {
    let (store, _tmp) = temp_store();
    let a = store.create_task(NewTask::new("wf", "coder", "a")).unwrap();
    update(&store, a, TaskState::Assigned);

    let export = store.export("wf").unwrap();
    let json = serde_json::to_value(&export).unwrap();
    assert_eq!(json["workflow_id"], "wf");
    assert_eq!(json["tasks"][0]["state"], "assigned");
    assert_eq!(json["history"].as_array().unwrap().len(), 2);
    assert_eq!(json["summary"]["reason"], "running");
}
