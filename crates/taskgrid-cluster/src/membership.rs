//! Worker registry — tracks worker records and their liveness.
//!
//! Heartbeats go straight through to [`TaskStore::update_worker`], which
//! merges them in one transaction. The registry adds the liveness policy:
//! a worker that stops sending heartbeats is deleted by
//! [`WorkerRegistry::sweep_dead_workers`], releasing its task assignments.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use taskgrid_state::{TaskStore, Worker, WorkerId, WorkerState, epoch_secs};

use crate::error::{ClusterError, ClusterResult};

/// Server-side view of the worker fleet.
#[derive(Clone)]
pub struct WorkerRegistry {
    store: Arc<dyn TaskStore>,
    /// Workers still starting up are reaped after this long.
    init_timeout: Duration,
    /// Any worker is reaped after this long without a heartbeat.
    dead_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            init_timeout: Duration::from_secs(300),
            dead_timeout: Duration::from_secs(60),
        }
    }

    /// Set the timeout for UNINITIALIZED / INITIALIZING workers.
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Set the dead worker detection timeout.
    pub fn with_dead_timeout(mut self, timeout: Duration) -> Self {
        self.dead_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Accept a heartbeat. A version conflict leaves the stored record
    /// untouched and is retryable.
    pub fn update_worker(&self, report: &Worker) -> ClusterResult<Worker> {
        match self.store.update_worker(report) {
            Ok(worker) => {
                debug!(
                    worker_id = %worker.id,
                    version = worker.version,
                    tasks = worker.tasks.len(),
                    "heartbeat accepted"
                );
                Ok(worker)
            }
            Err(e) => {
                if e.is_retryable() {
                    debug!(worker_id = %report.id, error = %e, "heartbeat rejected");
                } else {
                    warn!(worker_id = %report.id, error = %e, "heartbeat failed");
                }
                Err(e.into())
            }
        }
    }

    /// The authoritative worker record, task states refreshed.
    pub fn get_worker(&self, id: &str) -> ClusterResult<Worker> {
        self.store
            .get_worker(id)?
            .ok_or_else(|| ClusterError::WorkerNotFound(id.to_string()))
    }

    pub fn list_workers(&self) -> ClusterResult<Vec<Worker>> {
        Ok(self.store.list_workers()?)
    }

    /// Delete workers whose last heartbeat is too old as of `now` (Unix
    /// seconds). Returns the ids removed.
    ///
    /// Workers that never sent a heartbeat are left alone. A failure to
    /// delete one worker is logged and the sweep moves on; the worker is
    /// checked again on the next sweep.
    pub fn sweep_dead_workers(&self, now: u64) -> ClusterResult<Vec<WorkerId>> {
        let mut reaped = Vec::new();
        for worker in self.store.list_workers()? {
            if !self.is_dead(&worker, now) {
                continue;
            }
            match self.store.delete_worker(&worker.id) {
                Ok(true) => {
                    info!(
                        worker_id = %worker.id,
                        state = %worker.state,
                        last_heartbeat = worker.last_heartbeat,
                        orphaned = worker.tasks.len(),
                        "reaped dead worker"
                    );
                    reaped.push(worker.id);
                }
                Ok(false) => {}
                Err(e) => warn!(worker_id = %worker.id, error = %e, "failed to reap worker"),
            }
        }
        Ok(reaped)
    }

    /// Sweep as of the current time.
    pub fn sweep(&self) -> ClusterResult<Vec<WorkerId>> {
        self.sweep_dead_workers(epoch_secs())
    }

    fn is_dead(&self, worker: &Worker, now: u64) -> bool {
        if worker.last_heartbeat == 0 {
            return false;
        }
        let silent = Duration::from_secs(now.saturating_sub(worker.last_heartbeat));
        let starting = matches!(
            worker.state,
            WorkerState::Uninitialized | WorkerState::Initializing
        );
        (starting && silent > self.init_timeout) || silent > self.dead_timeout
    }
}
