use crate::types::Complexity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;
use wavesmith_core::WavesmithError;

/// Source of truth for which executors can serve a capability.
pub trait CapabilityRegistry: Send + Sync {
    /// Executors advertising `capability`, in preference order. Empty is valid.
    fn executors_for(&self, capability: &str) -> Vec<String>;
}

/// Registry backed by a fixed map, typically loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCapabilityRegistry {
    capabilities: HashMap<String, Vec<String>>,
}

impl StaticCapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register executors for a capability, appending to any already known.
    pub fn register(&mut self, capability: impl Into<String>, executors: Vec<String>) {
        let entry = self.capabilities.entry(capability.into()).or_default();
        for executor in executors {
            if !entry.contains(&executor) {
                entry.push(executor);
            }
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>, executors: Vec<String>) -> Self {
        self.register(capability, executors);
        self
    }

    /// Number of known capabilities.
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl FromIterator<(String, Vec<String>)> for StaticCapabilityRegistry {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(entries: I) -> Self {
        let mut registry = Self::new();
        for (capability, executors) in entries {
            registry.register(capability, executors);
        }
        registry
    }
}

impl CapabilityRegistry for StaticCapabilityRegistry {
    fn executors_for(&self, capability: &str) -> Vec<String> {
        self.capabilities
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }
}

/// One task waiting for an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentRequest {
    pub task_id: Uuid,
    pub capability: String,
    pub complexity: Complexity,
}

/// A task that fell back to the default executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentWarning {
    pub task_id: Uuid,
    pub capability: String,
    pub fallback: String,
}

impl std::fmt::Display for AssignmentWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (task {} routed to '{}')",
            WavesmithError::UnassignableCapability(self.capability.clone()),
            self.task_id,
            self.fallback
        )
    }
}

/// Result of assigning a batch of tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Assignment {
    /// Tasks per executor, in request order.
    pub by_executor: BTreeMap<String, Vec<Uuid>>,
    pub by_task: HashMap<Uuid, String>,
    /// Sum of complexity weights per executor.
    pub load: BTreeMap<String, u32>,
    pub warnings: Vec<AssignmentWarning>,
}

impl Assignment {
    /// Executor bound to `task_id`.
    pub fn executor_for(&self, task_id: Uuid) -> Option<&str> {
        self.by_task.get(&task_id).map(String::as_str)
    }
}

/// Least-load assignment of tasks to capable executors.
pub struct AgentAssigner {
    registry: Arc<dyn CapabilityRegistry>,
    default_executor: String,
}

impl AgentAssigner {
    pub fn new(registry: Arc<dyn CapabilityRegistry>, default_executor: impl Into<String>) -> Self {
        Self {
            registry,
            default_executor: default_executor.into(),
        }
    }

    /// Executor used when no registered one advertises a capability.
    pub fn default_executor(&self) -> &str {
        &self.default_executor
    }

    /// Bind every request to exactly one executor.
    ///
    /// Among the executors advertising the capability, the one with the
    /// smallest cumulative load wins; ties go to the earlier registry entry.
    /// A capability nobody serves goes to the default executor and leaves a
    /// warning; it never fails the batch.
    pub fn assign(&self, requests: &[AssignmentRequest]) -> Assignment {
        let mut assignment = Assignment::default();

        for request in requests {
            let candidates = self.registry.executors_for(&request.capability);
            let chosen = candidates
                .iter()
                .enumerate()
                .min_by_key(|(idx, executor)| {
                    (
                        assignment.load.get(executor.as_str()).copied().unwrap_or(0),
                        *idx,
                    )
                })
                .map(|(_, executor)| executor.clone());

            let executor = match chosen {
                Some(executor) => executor,
                None => {
                    let warning = AssignmentWarning {
                        task_id: request.task_id,
                        capability: request.capability.clone(),
                        fallback: self.default_executor.clone(),
                    };
                    warn!(
                        task_id = %request.task_id,
                        capability = %request.capability,
                        fallback = %self.default_executor,
                        "No executor for capability, using default"
                    );
                    assignment.warnings.push(warning);
                    self.default_executor.clone()
                }
            };

            debug!(task_id = %request.task_id, executor = %executor, "Task assigned");
            *assignment.load.entry(executor.clone()).or_insert(0) += request.complexity.weight();
            assignment
                .by_executor
                .entry(executor.clone())
                .or_default()
                .push(request.task_id);
            assignment.by_task.insert(request.task_id, executor);
        }

        assignment
    }
}
