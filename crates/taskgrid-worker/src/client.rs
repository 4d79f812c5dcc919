//! How a worker reaches the server.

use async_trait::async_trait;

use taskgrid_cluster::{ClusterError, WorkerRegistry};
use taskgrid_state::Worker;

use crate::error::WorkerResult;

#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// The worker's record as the server sees it, or `None` before the
    /// first heartbeat registers it.
    async fn get_worker(&self, id: &str) -> WorkerResult<Option<Worker>>;

    /// Send a heartbeat. Returns the merged record.
    async fn update_worker(&self, report: &Worker) -> WorkerResult<Worker>;
}

/// In-process client for a worker running next to the scheduler.
pub struct LocalClient {
    registry: WorkerRegistry,
}

impl LocalClient {
    pub fn new(registry: WorkerRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl WorkerClient for LocalClient {
    async fn get_worker(&self, id: &str) -> WorkerResult<Option<Worker>> {
        match self.registry.get_worker(id) {
            Ok(worker) => Ok(Some(worker)),
            Err(ClusterError::WorkerNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_worker(&self, report: &Worker) -> WorkerResult<Worker> {
        Ok(self.registry.update_worker(report)?)
    }
}
