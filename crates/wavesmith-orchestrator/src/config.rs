use crate::assignment::StaticCapabilityRegistry;
use crate::coordinator::CoordinatorConfig;
use crate::retry::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use wavesmith_core::{WavesmithError, WavesmithResult};
use wavesmith_store::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS};

/// Top-level configuration, usually read from `wavesmith.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WavesmithConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Age in days after which `cleanup` deletes tasks.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
    #[serde(default)]
    pub assignment: AssignmentSettings,
    #[serde(default)]
    pub defaults: TaskDefaults,
    #[serde(default)]
    pub validation: ValidationSettings,
    /// Capability name → executor ids, in preference order.
    #[serde(default)]
    pub capabilities: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_actor")]
    pub actor: String,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            actor: default_actor(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentSettings {
    /// Executor that takes tasks nobody else advertises.
    #[serde(default = "default_executor")]
    pub default_executor: String,
}

impl Default for AssignmentSettings {
    fn default() -> Self {
        Self {
            default_executor: default_executor(),
        }
    }
}

/// Values stamped on every task the orchestrator creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefaults {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSettings {
    /// Minimum completed share of complexity weight for a workflow to validate.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/wavesmith.db")
}
fn default_retention_days() -> u32 {
    30
}
fn default_max_parallelism() -> usize {
    4
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_actor() -> String {
    "coordinator".to_string()
}
fn default_executor() -> String {
    "general".to_string()
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_min_confidence() -> f64 {
    0.8
}

impl Default for WavesmithConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            retention_days: default_retention_days(),
            coordinator: CoordinatorSettings::default(),
            assignment: AssignmentSettings::default(),
            defaults: TaskDefaults::default(),
            validation: ValidationSettings::default(),
            capabilities: BTreeMap::new(),
        }
    }
}

impl WavesmithConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> WavesmithResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| WavesmithError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> WavesmithResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            WavesmithError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> WavesmithResult<()> {
        if self.coordinator.max_parallelism == 0 {
            return Err(WavesmithError::Config(
                "coordinator.max_parallelism must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.validation.min_confidence) {
            return Err(WavesmithError::Config(format!(
                "validation.min_confidence must be within [0, 1], got {}",
                self.validation.min_confidence
            )));
        }
        if self.coordinator.backoff_base_ms > self.coordinator.backoff_max_ms {
            return Err(WavesmithError::Config(
                "coordinator.backoff_base_ms exceeds backoff_max_ms".to_string(),
            ));
        }
        if self.assignment.default_executor.trim().is_empty() {
            return Err(WavesmithError::Config(
                "assignment.default_executor must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Coordinator settings in the form the coordinator takes.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_parallelism: self.coordinator.max_parallelism,
            backoff: BackoffPolicy {
                backoff_base_ms: self.coordinator.backoff_base_ms,
                backoff_max_ms: self.coordinator.backoff_max_ms,
            },
            actor: self.coordinator.actor.clone(),
        }
    }

    /// Capability registry built from the `[capabilities]` table.
    pub fn registry(&self) -> StaticCapabilityRegistry {
        self.capabilities
            .iter()
            .map(|(capability, executors)| (capability.clone(), executors.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::CapabilityRegistry;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = WavesmithConfig::from_toml_str("").unwrap();
        assert_eq!(config, WavesmithConfig::default());
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.coordinator.max_parallelism, 4);
        assert_eq!(config.defaults.timeout_secs, 300);
        assert_eq!(config.defaults.max_retries, 3);
        assert_eq!(config.assignment.default_executor, "general");
        assert!((config.validation.min_confidence - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_full_document() {
        let config = WavesmithConfig::from_toml_str(
            r#"
            database_path = "/var/lib/wavesmith/tasks.db"
            retention_days = 7

            [coordinator]
            max_parallelism = 8
            backoff_base_ms = 100
            actor = "night-shift"

            [defaults]
            max_retries = 1

            [capabilities]
            rust = ["ferris", "crab"]
            docs = ["scribe"]
            "#,
        )
        .unwrap();
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.coordinator.backoff_max_ms, 30_000);

        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.max_parallelism, 8);
        assert_eq!(coordinator.backoff.backoff_base_ms, 100);
        assert_eq!(coordinator.actor, "night-shift");

        let registry = config.registry();
        assert_eq!(registry.executors_for("rust"), vec!["ferris", "crab"]);
        assert!(registry.executors_for("go").is_empty());
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for doc in [
            "[coordinator]\nmax_parallelism = 0",
            "[validation]\nmin_confidence = 1.5",
            "[coordinator]\nbackoff_base_ms = 5000\nbackoff_max_ms = 10",
            "retention_days = \"forever\"",
        ] {
            let err = WavesmithConfig::from_toml_str(doc).unwrap_err();
            assert!(matches!(err, WavesmithError::Config(_)), "{doc}: {err}");
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wavesmith.toml");
        std::fs::write(&path, "retention_days = 3\n").unwrap();
        assert_eq!(WavesmithConfig::load(&path).unwrap().retention_days, 3);
        assert!(WavesmithConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
