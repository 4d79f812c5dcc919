//! The scheduling loop.
//!
//! Each tick reaps dead workers, reads the next chunk of the task queue,
//! and tries to place every task in it through the configured backend.
//! A task that cannot be placed stays queued and is retried on a later
//! pass; nothing in a tick blocks on one task for longer than the offer
//! and accept timeouts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use taskgrid_cluster::WorkerRegistry;
use taskgrid_core::GridConfig;
use taskgrid_state::{StateError, Task, TaskId, TaskStore, WorkerId};

use crate::backend::{Backend, BackendRegistry};
use crate::error::SchedulerResult;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Tasks placed this tick, with the worker each went to.
    pub assigned: Vec<(TaskId, WorkerId)>,
    /// Tasks the backend had no offer for (or timed out on).
    pub unscheduled: Vec<TaskId>,
    /// Tasks whose offer could not be accepted.
    pub accept_failures: Vec<TaskId>,
    /// Workers removed by the dead-worker sweep.
    pub reaped: Vec<WorkerId>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
            && self.unscheduled.is_empty()
            && self.accept_failures.is_empty()
            && self.reaped.is_empty()
    }
}

enum Placement {
    Assigned(WorkerId),
    Unscheduled,
    AcceptFailed,
    Skipped,
}

pub struct SchedulingLoop {
    store: Arc<dyn TaskStore>,
    registry: WorkerRegistry,
    backends: Arc<BackendRegistry>,
    config: GridConfig,
    rate: Duration,
    chunk: usize,
    offer_timeout: Duration,
    accept_timeout: Duration,
    /// Queue position to resume from; `None` starts at the head.
    cursor: Option<u64>,
}

impl SchedulingLoop {
    pub fn new(
        registry: WorkerRegistry,
        backends: Arc<BackendRegistry>,
        config: &GridConfig,
    ) -> SchedulerResult<Self> {
        let scheduler = &config.scheduler;
        Ok(Self {
            store: registry.store().clone(),
            rate: scheduler.schedule_rate()?,
            chunk: scheduler.schedule_chunk.max(1),
            offer_timeout: scheduler.offer_timeout()?,
            accept_timeout: scheduler.accept_timeout()?,
            registry,
            backends,
            config: config.clone(),
            cursor: None,
        })
    }

    /// Run one scheduling pass.
    pub async fn tick(&mut self) -> SchedulerResult<TickReport> {
        let mut report = TickReport {
            reaped: self.sweep_workers(),
            ..Default::default()
        };

        let chunk = self.store.read_queue(self.cursor, self.chunk)?;
        self.cursor = if chunk.tasks.len() < self.chunk {
            None
        } else {
            chunk.cursor
        };
        if chunk.tasks.is_empty() {
            return Ok(report);
        }

        let backend = self
            .backends
            .resolve(&self.config.scheduler.backend, &self.config)?;

        for task in &chunk.tasks {
            match self.place(backend.as_ref(), task).await? {
                Placement::Assigned(worker_id) => report.assigned.push((task.id.clone(), worker_id)),
                Placement::Unscheduled => report.unscheduled.push(task.id.clone()),
                Placement::AcceptFailed => report.accept_failures.push(task.id.clone()),
                Placement::Skipped => {}
            }
        }
        Ok(report)
    }

    /// Tick at the configured rate until `shutdown` fires.
    ///
    /// A failed tick is logged and retried on the next one, unless
    /// `exit_on_error` is set, in which case the error is returned.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SchedulerResult<()> {
        info!(
            backend = %self.config.scheduler.backend,
            rate_ms = self.rate.as_millis() as u64,
            chunk = self.chunk,
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.rate) => {
                    match self.tick().await {
                        Ok(report) if !report.is_empty() => {
                            info!(
                                assigned = report.assigned.len(),
                                unscheduled = report.unscheduled.len(),
                                accept_failures = report.accept_failures.len(),
                                reaped = report.reaped.len(),
                                "scheduling tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "scheduling tick failed");
                            if self.config.scheduler.exit_on_error {
                                return Err(e);
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    fn sweep_workers(&self) -> Vec<WorkerId> {
        match self.registry.sweep() {
            Ok(reaped) => reaped,
            Err(e) => {
                warn!(error = %e, "dead worker sweep failed");
                Vec::new()
            }
        }
    }

    async fn place(&self, backend: &dyn Backend, task: &Task) -> SchedulerResult<Placement> {
        let mut offer = match timeout(self.offer_timeout, backend.schedule(task)).await {
            Ok(Some(offer)) => offer,
            Ok(None) => {
                debug!(task_id = %task.id, backend = backend.name(), "no offer");
                return Ok(Placement::Unscheduled);
            }
            Err(_) => {
                warn!(task_id = %task.id, backend = backend.name(), "offer timed out");
                return Ok(Placement::Unscheduled);
            }
        };

        if let Some(accept) = offer.accept.take() {
            match timeout(self.accept_timeout, accept()).await {
                Ok(Ok(())) => {
                    debug!(task_id = %task.id, worker_id = %offer.worker.id, "offer accepted");
                }
                Ok(Err(e)) => {
                    warn!(task_id = %task.id, worker_id = %offer.worker.id, error = %e, "offer accept failed");
                    return Ok(Placement::AcceptFailed);
                }
                Err(_) => {
                    warn!(task_id = %task.id, worker_id = %offer.worker.id, "offer accept timed out");
                    return Ok(Placement::AcceptFailed);
                }
            }
        }

        match self.store.assign_task(&task.id, &offer.worker) {
            Ok(worker) => Ok(Placement::Assigned(worker.id)),
            // The task or worker changed since the chunk was read; the next
            // pass sees the new state.
            Err(
                e @ (StateError::AlreadyAssigned { .. }
                | StateError::Transition(_)
                | StateError::VersionConflict { .. }
                | StateError::NotFound(_)),
            ) => {
                warn!(task_id = %task.id, worker_id = %offer.worker.id, error = %e, "assignment skipped");
                Ok(Placement::Skipped)
            }
            Err(e) => Err(e.into()),
        }
    }
}
