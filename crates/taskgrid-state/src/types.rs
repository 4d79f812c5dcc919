//! Domain types for the TaskGrid state store.
//!
//! Tasks, workers, and the small value types they share. All types are
//! serializable to/from JSON for storage in redb tables and for the
//! worker ↔ server wire.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a task (a ULID string when server-assigned).
pub type TaskId = String;

/// Unique identifier for a worker.
pub type WorkerId = String;

/// Worker metadata key marking a record as provisionable template capacity.
pub const TEMPLATE_KEY: &str = "template";

/// Task tag prefix for hard metadata requirements: `require:<key>` = value.
pub const REQUIRE_TAG_PREFIX: &str = "require:";

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Task state ─────────────────────────────────────────────────────

/// Lifecycle state of a task.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    #[default]
    Unknown,
    Queued,
    Initializing,
    Running,
    Paused,
    Complete,
    Error,
    SystemError,
    Canceled,
}

impl TaskState {
    pub const ALL: [TaskState; 9] = [
        TaskState::Unknown,
        TaskState::Queued,
        TaskState::Initializing,
        TaskState::Running,
        TaskState::Paused,
        TaskState::Complete,
        TaskState::Error,
        TaskState::SystemError,
        TaskState::Canceled,
    ];

    /// COMPLETE, ERROR, SYSTEM_ERROR and CANCELED never change again
    /// except through an explicit restart.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Complete | TaskState::Error | TaskState::SystemError | TaskState::Canceled
        )
    }

    /// Assigned to a worker and expected to be executing.
    pub fn is_active(self) -> bool {
        matches!(self, TaskState::Initializing | TaskState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Unknown => "UNKNOWN",
            TaskState::Queued => "QUEUED",
            TaskState::Initializing => "INITIALIZING",
            TaskState::Running => "RUNNING",
            TaskState::Paused => "PAUSED",
            TaskState::Complete => "COMPLETE",
            TaskState::Error => "ERROR",
            TaskState::SystemError => "SYSTEM_ERROR",
            TaskState::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Resources ──────────────────────────────────────────────────────

/// A quantity of compute: worker capacity, availability, or a task request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpu_cores: u32,
    pub ram_gb: f64,
    pub disk_gb: f64,
}

impl Resources {
    pub fn new(cpu_cores: u32, ram_gb: f64, disk_gb: f64) -> Self {
        Self {
            cpu_cores,
            ram_gb,
            disk_gb,
        }
    }

    /// Component-wise subtraction clamped at zero.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_cores: self.cpu_cores.saturating_sub(other.cpu_cores),
            ram_gb: (self.ram_gb - other.ram_gb).max(0.0),
            disk_gb: (self.disk_gb - other.disk_gb).max(0.0),
        }
    }

    pub fn add(&self, other: &Resources) -> Resources {
        Resources {
            cpu_cores: self.cpu_cores.saturating_add(other.cpu_cores),
            ram_gb: self.ram_gb + other.ram_gb,
            disk_gb: self.disk_gb + other.disk_gb,
        }
    }
}

/// What a task asks of the worker it runs on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskResources {
    pub cpu_cores: u32,
    pub ram_gb: f64,
    pub disk_gb: f64,
    /// Allowed zones. Empty means any zone.
    pub zones: Vec<String>,
    pub preemptible: bool,
}

impl TaskResources {
    /// The quantities deducted from a worker's availability.
    pub fn request(&self) -> Resources {
        Resources::new(self.cpu_cores, self.ram_gb, self.disk_gb)
    }
}

// ── Task ───────────────────────────────────────────────────────────

/// One command to run as part of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Executor {
    /// argv; the first element is the program.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Working directory relative to the worker's work dir.
    pub workdir: Option<String>,
    /// Host ports the executor binds.
    pub ports: Vec<u16>,
}

/// Bytes of each executor stream the server keeps per log entry.
pub const MAX_EXECUTOR_LOG_SIZE: usize = 10 * 1024;

/// Output of one executor: its exit code and the tail of each stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorLog {
    /// `None` while running, or when killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutorLog {
    /// Keep at most the last `max_bytes` of each stream.
    pub fn truncate_to_tail(&mut self, max_bytes: usize) {
        for stream in [&mut self.stdout, &mut self.stderr] {
            let keep = tail(stream, max_bytes).len();
            stream.drain(..stream.len() - keep);
        }
    }
}

/// The last `max_bytes` of `s`, moved forward to a char boundary.
pub fn tail(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// One execution attempt of a task on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    pub worker_id: WorkerId,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    /// The state this attempt ended in, or the latest state while open.
    pub state: TaskState,
    /// Latest output reported by the worker, one entry per started executor.
    #[serde(default)]
    pub executor_logs: Vec<ExecutorLog>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub resources: TaskResources,
    pub executors: Vec<Executor>,
    pub tags: BTreeMap<String, String>,
    pub logs: Vec<TaskLog>,
    /// Number of times this task has been restarted.
    pub restarts: u32,
    pub created_at: u64,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_resources(mut self, cpu_cores: u32, ram_gb: f64, disk_gb: f64) -> Self {
        self.resources.cpu_cores = cpu_cores;
        self.resources.ram_gb = ram_gb;
        self.resources.disk_gb = disk_gb;
        self
    }

    pub fn with_executor(mut self, command: &[&str]) -> Self {
        self.executors.push(Executor {
            command: command.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        });
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Host ports any of the task's executors bind.
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.executors.iter().flat_map(|e| e.ports.iter().copied())
    }

    /// Metadata requirements expressed as `require:<key>` tags.
    pub fn requirements(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.tags.iter().filter_map(|(k, v)| {
            k.strip_prefix(REQUIRE_TAG_PREFIX)
                .map(|key| (key, v.as_str()))
        })
    }

    /// Close the open execution log, if any, with the given end state.
    pub fn close_log(&mut self, state: TaskState, now: u64) {
        if let Some(log) = self.logs.last_mut() {
            if log.ended_at.is_none() {
                log.ended_at = Some(now);
                log.state = state;
            }
        }
    }
}

// ── Worker ─────────────────────────────────────────────────────────

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    #[default]
    Uninitialized,
    Initializing,
    Alive,
    Dead,
    Gone,
}

impl WorkerState {
    pub fn is_schedulable(self) -> bool {
        !matches!(self, WorkerState::Dead | WorkerState::Gone)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Uninitialized => "UNINITIALIZED",
            WorkerState::Initializing => "INITIALIZING",
            WorkerState::Alive => "ALIVE",
            WorkerState::Dead => "DEAD",
            WorkerState::Gone => "GONE",
        };
        f.write_str(s)
    }
}

/// A task as seen from the worker record it is assigned to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignedTask {
    pub state: TaskState,
    pub resources: Resources,
    /// Filled in when the server hands the assignment to the worker.
    pub executors: Vec<Executor>,
    /// Sent by the worker in heartbeats and copied into the task's log;
    /// never kept on the worker record.
    pub logs: Vec<ExecutorLog>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Worker {
    pub id: WorkerId,
    pub state: WorkerState,
    /// Total capacity.
    pub resources: Resources,
    /// Capacity minus the requests of assigned tasks.
    pub available: Resources,
    pub zone: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub tasks: BTreeMap<TaskId, AssignedTask>,
    /// Host ports currently bound on the worker.
    pub active_ports: Vec<u16>,
    /// Incremented by the server on every accepted update and assignment.
    pub version: u64,
    pub last_heartbeat: u64,
}

impl Worker {
    pub fn new(id: impl Into<String>, resources: Resources) -> Self {
        Self {
            id: id.into(),
            resources,
            available: resources,
            ..Default::default()
        }
    }

    /// A template stands in for capacity that does not exist yet.
    pub fn template(id: impl Into<String>, template: impl Into<String>, resources: Resources) -> Self {
        let mut worker = Self::new(id, resources);
        worker
            .metadata
            .insert(TEMPLATE_KEY.to_string(), template.into());
        worker
    }

    pub fn is_template(&self) -> bool {
        self.metadata.contains_key(TEMPLATE_KEY)
    }

    /// Recompute `available` as total minus every assigned task's request.
    pub fn recompute_available(&mut self) {
        let used = self
            .tasks
            .values()
            .fold(Resources::default(), |acc, t| acc.add(&t.resources));
        self.available = self.resources.saturating_sub(&used);
    }
}
