use taskgrid_state::StateError;
use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl ClusterError {
    /// True for a version conflict; the caller should refetch and resend.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClusterError::State(e) => e.is_retryable(),
            ClusterError::WorkerNotFound(_) => false,
        }
    }
}
