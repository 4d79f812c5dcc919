use std::time::Duration;

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("server call timed out after {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Config(#[from] taskgrid_core::ConfigError),

    #[error(transparent)]
    Cluster(#[from] taskgrid_cluster::ClusterError),
}

impl WorkerError {
    /// Conflicts and timeouts clear up on a later tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Timeout(_) => true,
            WorkerError::Cluster(e) => e.is_retryable(),
            WorkerError::Config(_) => false,
        }
    }
}
