//! Error types for the TaskGrid state store.

use thiserror::Error;

use crate::transition::TransitionError;
use crate::types::TaskState;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("task {task_id} is already assigned to worker {worker_id}")]
    AlreadyAssigned { task_id: String, worker_id: String },

    #[error("version conflict on worker {worker_id}: stored {stored}, submitted {submitted}")]
    VersionConflict {
        worker_id: String,
        stored: u64,
        submitted: u64,
    },

    #[error("task {task_id} reached the restart limit ({restarts})")]
    MaxRestartsReached { task_id: String, restarts: u32 },

    #[error("task {task_id} is {state}; only terminal tasks can be restarted")]
    NotRestartable { task_id: String, state: TaskState },

    #[error("task {task_id}: state changes must go through transition_task")]
    StateChangeRejected { task_id: String },
}

impl StateError {
    /// Only an optimistic-concurrency conflict is worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StateError::VersionConflict { .. })
    }
}
