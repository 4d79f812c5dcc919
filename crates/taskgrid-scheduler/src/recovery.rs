//! Stuck-task recovery.
//!
//! A worker that disappears takes its running tasks with it, but the task
//! records still say INITIALIZING or RUNNING. The sweep marks those tasks
//! SYSTEM_ERROR and restarts SYSTEM_ERROR tasks that have attempts left.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use taskgrid_core::GridConfig;
use taskgrid_state::{StateResult, Task, TaskFilter, TaskId, TaskState, TaskStore};

use crate::error::SchedulerResult;

/// Only these states can be orphaned or restarted.
const SWEPT_STATES: [TaskState; 3] = [
    TaskState::Initializing,
    TaskState::Running,
    TaskState::SystemError,
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Active tasks whose worker is gone, now SYSTEM_ERROR.
    pub orphaned: Vec<TaskId>,
    /// SYSTEM_ERROR tasks returned to the queue.
    pub restarted: Vec<TaskId>,
    /// Tasks orphaned this sweep that are out of restarts.
    pub exhausted: Vec<TaskId>,
}

pub struct RecoverySweep {
    store: Arc<dyn TaskStore>,
    rate: Duration,
    max_restarts: u32,
}

impl RecoverySweep {
    pub fn new(store: Arc<dyn TaskStore>, config: &GridConfig) -> SchedulerResult<Self> {
        Ok(Self {
            store,
            rate: config.scheduler.recovery_rate()?,
            max_restarts: config.scheduler.max_restarts,
        })
    }

    /// One pass over every task that could need recovery. Per-task
    /// failures are logged and skipped.
    pub fn sweep(&self) -> SchedulerResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let filter = TaskFilter {
            states: SWEPT_STATES.to_vec(),
            ..Default::default()
        };
        for task in self.store.list_tasks(&filter)? {
            if let Err(e) = self.recover(task, &mut report) {
                warn!(error = %e, "task recovery failed");
            }
        }
        Ok(report)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(rate_ms = self.rate.as_millis() as u64, "recovery sweep started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.rate) => {
                    match self.sweep() {
                        Ok(report) if report != RecoveryReport::default() => {
                            info!(
                                orphaned = report.orphaned.len(),
                                restarted = report.restarted.len(),
                                exhausted = report.exhausted.len(),
                                "recovery sweep"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "recovery sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("recovery sweep shutting down");
                    break;
                }
            }
        }
    }

    fn recover(&self, mut task: Task, report: &mut RecoveryReport) -> StateResult<()> {
        let mut orphaned_now = false;
        if task.state.is_active() && !self.has_live_worker(&task.id)? {
            task = self.store.transition_task(&task.id, TaskState::SystemError)?;
            warn!(task_id = %task.id, "worker lost, task marked SYSTEM_ERROR");
            report.orphaned.push(task.id.clone());
            orphaned_now = true;
        }

        if task.state != TaskState::SystemError {
            return Ok(());
        }
        if task.restarts < self.max_restarts {
            let restarted = self.store.restart_task(&task.id, self.max_restarts)?;
            info!(task_id = %task.id, restarts = restarted.restarts, "task requeued");
            report.restarted.push(task.id);
        } else if orphaned_now {
            error!(
                task_id = %task.id,
                restarts = task.restarts,
                "task out of restarts, needs manual intervention"
            );
            report.exhausted.push(task.id);
        }
        Ok(())
    }

    fn has_live_worker(&self, task_id: &str) -> StateResult<bool> {
        match self.store.task_worker(task_id)? {
            Some(worker_id) => Ok(self.store.get_worker(&worker_id)?.is_some()),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgrid_state::{Resources, StateStore, Worker};

    fn setup(max_restarts: u32) -> (Arc<dyn TaskStore>, RecoverySweep) {
        let store: Arc<dyn TaskStore> = Arc::new(StateStore::open_in_memory().unwrap());
        let mut config = GridConfig::default();
        config.scheduler.max_restarts = max_restarts;
        let sweep = RecoverySweep::new(store.clone(), &config).unwrap();
        (store, sweep)
    }

    fn running_on(store: &Arc<dyn TaskStore>, worker_id: &str) -> Task {
        let task = store.create_task(Task::new("t")).unwrap();
        store
            .assign_task(&task.id, &Worker::new(worker_id, Resources::new(4, 8.0, 100.0)))
            .unwrap();
        store.transition_task(&task.id, TaskState::Running).unwrap()
    }

    #[test]
    fn orphaned_task_is_failed_and_requeued() {
        let (store, sweep) = setup(3);
        let task = running_on(&store, "w1");
        store.delete_worker("w1").unwrap();

        let report = sweep.sweep().unwrap();
        assert_eq!(report.orphaned, vec![task.id.clone()]);
        assert_eq!(report.restarted, vec![task.id.clone()]);

        let stored = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Queued);
        assert_eq!(stored.restarts, 1);
        assert_eq!(store.read_queue(None, 10).unwrap().tasks.len(), 1);
    }

    #[test]
    fn tasks_on_live_workers_are_left_alone() {
        let (store, sweep) = setup(3);
        let task = running_on(&store, "w1");

        assert_eq!(sweep.sweep().unwrap(), RecoveryReport::default());
        assert_eq!(
            store.get_task(&task.id).unwrap().unwrap().state,
            TaskState::Running
        );
    }

    #[test]
    fn exhausted_task_stays_terminal() {
        let (store, sweep) = setup(0);
        let task = running_on(&store, "w1");
        store.delete_worker("w1").unwrap();

        let report = sweep.sweep().unwrap();
        assert_eq!(report.exhausted, vec![task.id.clone()]);
        assert!(report.restarted.is_empty());
        assert_eq!(
            store.get_task(&task.id).unwrap().unwrap().state,
            TaskState::SystemError
        );

        // Already terminal: later sweeps neither fail it again nor report it.
        assert_eq!(sweep.sweep().unwrap(), RecoveryReport::default());
    }

    #[test]
    fn system_error_reported_by_worker_is_restarted() {
        let (store, sweep) = setup(3);
        let task = running_on(&store, "w1");
        store
            .transition_task(&task.id, TaskState::SystemError)
            .unwrap();

        let report = sweep.sweep().unwrap();
        assert!(report.orphaned.is_empty());
        assert_eq!(report.restarted, vec![task.id]);
    }

    #[test]
    fn only_recoverable_states_are_swept() {
        let (store, sweep) = setup(3);
        let queued = store.create_task(Task::new("waiting")).unwrap();
        let initializing = store.create_task(Task::new("booting")).unwrap();
        store
            .assign_task(&initializing.id, &Worker::new("w1", Resources::new(4, 8.0, 100.0)))
            .unwrap();
        store.delete_worker("w1").unwrap();

        let report = sweep.sweep().unwrap();
        assert_eq!(report.orphaned, vec![initializing.id.clone()]);
        assert_eq!(
            store.get_task(&queued.id).unwrap().unwrap(),
            queued,
            "queued task without a worker is not touched"
        );
    }

    #[test]
    fn other_terminal_states_are_not_restarted() {
        let (store, sweep) = setup(3);
        let task = store.create_task(Task::new("t")).unwrap();
        store.transition_task(&task.id, TaskState::Error).unwrap();
        assert_eq!(sweep.sweep().unwrap(), RecoveryReport::default());
    }
}
