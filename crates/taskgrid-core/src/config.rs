//! taskgrid.toml configuration parser.
//!
//! Every field is optional in the file; missing values fall back to the
//! defaults below. Durations are kept as strings in the file model and
//! resolved through the accessor methods.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;

/// Errors raised while loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GridConfig {
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Name of the active backend: "local", "manual", "fleet", "batch".
    pub backend: String,
    /// How often the scheduling loop ticks.
    pub schedule_rate: String,
    /// Maximum number of queued tasks considered per tick.
    pub schedule_chunk: usize,
    /// Upper bound for a single `Backend::schedule` call.
    pub offer_timeout: String,
    /// Upper bound for an offer's accept callback.
    pub accept_timeout: String,
    /// Workers still initializing are reaped after this long without a heartbeat.
    pub node_init_timeout: String,
    /// Any worker is reaped after this long without a heartbeat.
    pub node_dead_timeout: String,
    /// How often the stuck-task recovery sweep runs.
    pub recovery_rate: String,
    /// System-error tasks are restarted automatically up to this many times.
    pub max_restarts: u32,
    /// Stop the daemon when a scheduling tick fails instead of retrying.
    pub exit_on_error: bool,
    /// Score weights, metric name → weight in [0, 1].
    pub weights: BTreeMap<String, f64>,
    pub local: LocalBackendConfig,
    pub fleet: FleetBackendConfig,
    pub batch: BatchBackendConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let mut weights = BTreeMap::new();
        weights.insert("startup-cost".to_string(), 1.0);
        weights.insert("resource-fit".to_string(), 0.5);
        Self {
            backend: "local".to_string(),
            schedule_rate: "1s".to_string(),
            schedule_chunk: 10,
            offer_timeout: "5s".to_string(),
            accept_timeout: "30s".to_string(),
            node_init_timeout: "5m".to_string(),
            node_dead_timeout: "1m".to_string(),
            recovery_rate: "10s".to_string(),
            max_restarts: 3,
            exit_on_error: false,
            weights,
            local: LocalBackendConfig::default(),
            fleet: FleetBackendConfig::default(),
            batch: BatchBackendConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn schedule_rate(&self) -> Result<Duration, ConfigError> {
        duration_field("scheduler.schedule_rate", &self.schedule_rate)
    }

    pub fn offer_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("scheduler.offer_timeout", &self.offer_timeout)
    }

    pub fn accept_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("scheduler.accept_timeout", &self.accept_timeout)
    }

    pub fn node_init_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("scheduler.node_init_timeout", &self.node_init_timeout)
    }

    pub fn node_dead_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("scheduler.node_dead_timeout", &self.node_dead_timeout)
    }

    pub fn recovery_rate(&self) -> Result<Duration, ConfigError> {
        duration_field("scheduler.recovery_rate", &self.recovery_rate)
    }
}

/// The local backend schedules onto the worker running inside the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocalBackendConfig {
    pub worker_id: String,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            worker_id: "local".to_string(),
        }
    }
}

/// Cloud VM fleet backend: existing fleet workers plus instance templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetBackendConfig {
    /// Command (argv) run to provision a template. Receives
    /// `TASKGRID_WORKER_ID` and `TASKGRID_TEMPLATE` in its environment.
    pub provision_command: Vec<String>,
    pub templates: Vec<WorkerTemplate>,
}

/// Batch-queue backend (HTCondor, Slurm, ...): one submitted job per task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchBackendConfig {
    /// Command (argv) run to submit a worker job. Receives
    /// `TASKGRID_WORKER_ID` and `TASKGRID_TASK_ID` in its environment.
    pub submit_command: Vec<String>,
    pub zone: Option<String>,
}

/// Capacity that can be provisioned on demand.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerTemplate {
    pub id: String,
    pub cpu_cores: u32,
    pub ram_gb: f64,
    pub disk_gb: f64,
    pub zone: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub id: String,
    /// How often the worker reconciles with the server.
    pub update_rate: String,
    /// Upper bound for a single call to the server.
    pub update_timeout: String,
    /// Directory executions run in.
    pub work_dir: PathBuf,
    /// Bytes of each executor's stdout and stderr tail sent per heartbeat.
    pub log_tail_size: usize,
    pub zone: Option<String>,
    pub resources: ResourceConfig,
    pub metadata: BTreeMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: "local".to_string(),
            update_rate: "5s".to_string(),
            update_timeout: "1s".to_string(),
            work_dir: PathBuf::from("taskgrid-work-dir"),
            log_tail_size: 10 * 1024,
            zone: None,
            resources: ResourceConfig::default(),
            metadata: BTreeMap::new(),
        }
    }
}

impl WorkerConfig {
    pub fn update_rate(&self) -> Result<Duration, ConfigError> {
        duration_field("worker.update_rate", &self.update_rate)
    }

    pub fn update_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("worker.update_timeout", &self.update_timeout)
    }
}

/// Self-reported worker capacity. Zero CPU or RAM is detected from the
/// host at startup; disk defaults to 100 GB.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceConfig {
    pub cpu_cores: u32,
    pub ram_gb: f64,
    pub disk_gb: f64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_cores: 0,
            ram_gb: 0.0,
            disk_gb: 100.0,
        }
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every duration string and the numeric bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        s.schedule_rate()?;
        s.offer_timeout()?;
        s.accept_timeout()?;
        s.node_init_timeout()?;
        s.node_dead_timeout()?;
        s.recovery_rate()?;
        self.worker.update_rate()?;
        self.worker.update_timeout()?;

        if s.schedule_chunk == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.schedule_chunk",
                reason: "must be at least 1".to_string(),
            });
        }
        if s.backend == "local" && s.local.worker_id != self.worker.id {
            return Err(ConfigError::Invalid {
                field: "scheduler.local.worker_id",
                reason: format!(
                    "local backend targets {:?} but the embedded worker is {:?}",
                    s.local.worker_id, self.worker.id
                ),
            });
        }
        for (metric, weight) in &s.weights {
            if !(0.0..=1.0).contains(weight) {
                return Err(ConfigError::Invalid {
                    field: "scheduler.weights",
                    reason: format!("weight for {metric} must be within [0, 1], got {weight}"),
                });
            }
        }
        Ok(())
    }
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}
