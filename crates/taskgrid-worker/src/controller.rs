//! Per-task execution controller.
//!
//! A [`TaskController`] owns one background execution. The execution moves
//! through INITIALIZING and RUNNING and ends in a terminal state; the
//! reconciler reads that state without blocking and cancels through a
//! watch channel. Dropping the controller cancels the execution too.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use taskgrid_state::{Executor, TaskId, TaskState};

use crate::engine::ExecutionEngine;
use crate::reconcile::LocalState;

pub struct TaskController {
    task_id: TaskId,
    ports: Vec<u16>,
    state: watch::Receiver<TaskState>,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskController {
    /// Spawn the execution on the current runtime.
    pub fn start(task_id: TaskId, executors: Vec<Executor>, engine: Arc<dyn ExecutionEngine>) -> Self {
        let (state_tx, state) = watch::channel(TaskState::Initializing);
        let (cancel, mut cancel_rx) = watch::channel(false);
        let ports = executors.iter().flat_map(|e| e.ports.iter().copied()).collect();

        let id = task_id.clone();
        let handle = tokio::spawn(async move {
            if *cancel_rx.borrow_and_update() {
                state_tx.send_replace(TaskState::Canceled);
                return;
            }
            state_tx.send_replace(TaskState::Running);

            let finished = tokio::select! {
                outcome = engine.run(&id, &executors) => outcome.task_state(),
                // Fires on cancel and when the controller is dropped.
                _ = cancel_rx.changed() => {
                    engine.stop(&id).await;
                    TaskState::Canceled
                }
            };
            debug!(task_id = %id, state = %finished, "controller finished");
            state_tx.send_replace(finished);
        });

        Self {
            task_id,
            ports,
            state,
            cancel,
            handle,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn is_cancel_requested(&self) -> bool {
        *self.cancel.borrow()
    }

    /// The state to report to the server.
    pub fn state(&self) -> TaskState {
        if self.is_cancel_requested() {
            TaskState::Canceled
        } else {
            *self.state.borrow()
        }
    }

    pub fn local_state(&self) -> LocalState {
        if self.is_cancel_requested() {
            return LocalState::Canceled;
        }
        let state = *self.state.borrow();
        if state.is_terminal() {
            LocalState::Complete(state)
        } else {
            LocalState::Active(state)
        }
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Cancel and wait for the execution to wind down.
    pub async fn stop(self) {
        self.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExecMetadata, ExecOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Engine that blocks until released, then returns a fixed outcome.
    struct GatedEngine {
        release: Notify,
        outcome: ExecOutcome,
        stopped: AtomicBool,
    }

    impl GatedEngine {
        fn new(outcome: ExecOutcome) -> Arc<Self> {
            Arc::new(Self {
                release: Notify::new(),
                outcome,
                stopped: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ExecutionEngine for GatedEngine {
        async fn run(&self, _task_id: &str, _executors: &[Executor]) -> ExecOutcome {
            self.release.notified().await;
            self.outcome.clone()
        }

        async fn inspect(&self, _task_id: &str) -> Option<ExecMetadata> {
            None
        }

        async fn stop(&self, _task_id: &str) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    async fn wait_for(controller: &TaskController, want: LocalState) {
        for _ in 0..100 {
            if controller.local_state() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("controller never reached {want:?}, is {:?}", controller.local_state());
    }

    #[tokio::test]
    async fn runs_to_the_engine_outcome() {
        let engine = GatedEngine::new(ExecOutcome::Complete);
        let controller = TaskController::start("t1".into(), vec![], engine.clone());

        wait_for(&controller, LocalState::Active(TaskState::Running)).await;
        engine.release.notify_one();
        wait_for(&controller, LocalState::Complete(TaskState::Complete)).await;
        assert_eq!(controller.state(), TaskState::Complete);
    }

    #[tokio::test]
    async fn failure_maps_to_error() {
        let engine = GatedEngine::new(ExecOutcome::Failed {
            executor: 0,
            exit_code: Some(1),
        });
        let controller = TaskController::start("t1".into(), vec![], engine.clone());
        engine.release.notify_one();
        wait_for(&controller, LocalState::Complete(TaskState::Error)).await;
    }

    #[tokio::test]
    async fn cancel_stops_the_engine() {
        let engine = GatedEngine::new(ExecOutcome::Complete);
        let controller = TaskController::start("t1".into(), vec![], engine.clone());
        wait_for(&controller, LocalState::Active(TaskState::Running)).await;

        controller.cancel();
        assert_eq!(controller.local_state(), LocalState::Canceled);
        assert_eq!(controller.state(), TaskState::Canceled);

        controller.stop().await;
        assert!(engine.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn ports_come_from_executors() {
        let engine = GatedEngine::new(ExecOutcome::Complete);
        let executors = vec![
            Executor {
                ports: vec![8080],
                ..Default::default()
            },
            Executor {
                ports: vec![9090, 9091],
                ..Default::default()
            },
        ];
        let controller = TaskController::start("t1".into(), executors, engine);
        assert_eq!(controller.ports(), &[8080, 9090, 9091]);
        assert_eq!(controller.task_id(), "t1");
    }
}
