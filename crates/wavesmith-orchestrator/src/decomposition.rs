use crate::types::Complexity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use wavesmith_core::{WavesmithError, WavesmithResult};
use wavesmith_store::Priority;

/// One atomic task proposed by a decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicTask {
    /// Decomposition-local id, referenced by `dependency_hints`.
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub complexity: Complexity,
    pub required_capability: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Whether validation demands this task completes.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl AtomicTask {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        required_capability: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            complexity: Complexity::default(),
            required_capability: required_capability.into(),
            action: None,
            priority: None,
            required: true,
        }
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// A request broken into atomic tasks plus ordering hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    pub task_type: String,
    pub atomic_tasks: Vec<AtomicTask>,
    /// Local id → local ids it depends on.
    #[serde(default)]
    pub dependency_hints: BTreeMap<String, Vec<String>>,
}

impl Decomposition {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            ..Self::default()
        }
    }

    pub fn with_task(mut self, task: AtomicTask) -> Self {
        self.atomic_tasks.push(task);
        self
    }

    /// Declare that `task` depends on `on`.
    pub fn with_dependency(mut self, task: impl Into<String>, on: impl Into<String>) -> Self {
        self.dependency_hints
            .entry(task.into())
            .or_default()
            .push(on.into());
        self
    }

    /// Hinted dependencies of a local id.
    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.dependency_hints
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Reject decompositions the scheduler cannot work with: no tasks,
    /// duplicate local ids, or hints naming ids that do not exist.
    pub fn validate(&self) -> WavesmithResult<()> {
        if self.atomic_tasks.is_empty() {
            return Err(WavesmithError::InvalidInput(
                "decomposition produced no tasks".to_string(),
            ));
        }
        let mut ids = HashSet::with_capacity(self.atomic_tasks.len());
        for task in &self.atomic_tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(WavesmithError::InvalidInput(format!(
                    "duplicate task id '{}' in decomposition",
                    task.id
                )));
            }
        }
        for (task, deps) in &self.dependency_hints {
            if !ids.contains(task.as_str()) {
                return Err(WavesmithError::NotFound(format!(
                    "dependency hint for unknown task '{task}'"
                )));
            }
            if let Some(missing) = deps.iter().find(|d| !ids.contains(d.as_str())) {
                return Err(WavesmithError::NotFound(format!(
                    "task '{task}' depends on unknown task '{missing}'"
                )));
            }
        }
        Ok(())
    }
}

/// Turns a free-form request into atomic tasks. Implemented outside the engine.
#[async_trait]
pub trait DecompositionService: Send + Sync {
    async fn decompose(
        &self,
        request: &str,
        language_hint: Option<&str>,
    ) -> WavesmithResult<Decomposition>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Decomposition {
        Decomposition::new("feature")
            .with_task(AtomicTask::new("spec", "Write the spec", "analysis"))
            .with_task(
                AtomicTask::new("code", "Implement it", "rust").with_complexity(Complexity::Complex),
            )
            .with_dependency("code", "spec")
    }

    #[test]
    fn test_valid_decomposition() {
        let d = sample();
        d.validate().unwrap();
        assert_eq!(d.dependencies_of("code"), &["spec".to_string()]);
        assert!(d.dependencies_of("spec").is_empty());
    }

    #[test]
    fn test_empty_decomposition_is_invalid() {
        let err = Decomposition::new("feature").validate().unwrap_err();
        assert!(matches!(err, WavesmithError::InvalidInput(_)));
    }

    #[test]
    fn test_unknown_hint_is_not_found() {
        let err = sample().with_dependency("code", "tests").validate().unwrap_err();
        assert!(matches!(err, WavesmithError::NotFound(_)));
        let err = sample().with_dependency("ghost", "spec").validate().unwrap_err();
        assert!(matches!(err, WavesmithError::NotFound(_)));
    }

    #[test]
    fn test_duplicate_ids_are_invalid() {
        let err = sample()
            .with_task(AtomicTask::new("spec", "again", "analysis"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, WavesmithError::InvalidInput(_)));
    }

    #[test]
    fn test_deserializes_with_defaults() {
        let d: Decomposition = serde_json::from_value(serde_json::json!({
            "task_type": "bugfix",
            "atomic_tasks": [
                {"id": "a", "description": "find it", "required_capability": "debug"}
            ]
        }))
        .unwrap();
        let task = &d.atomic_tasks[0];
        assert_eq!(task.complexity, Complexity::Moderate);
        assert!(task.required);
        assert!(d.dependency_hints.is_empty());
    }
}
