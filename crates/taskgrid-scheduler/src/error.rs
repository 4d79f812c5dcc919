//! Scheduler error types.

use thiserror::Error;

/// Errors that abort a scheduling tick or recovery sweep.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("failed to construct backend {name}: {source}")]
    BackendConstruction {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] taskgrid_core::ConfigError),

    #[error("state store error: {0}")]
    State(#[from] taskgrid_state::StateError),

    #[error("cluster error: {0}")]
    Cluster(#[from] taskgrid_cluster::ClusterError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
