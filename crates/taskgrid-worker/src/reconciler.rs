//! The worker reconciliation loop.
//!
//! Each tick fetches the worker's record, runs every task through the
//! [`reconcile`] table, and sends a heartbeat carrying local state.
//! Controllers whose terminal state went out in a heartbeat are dropped
//! only once the server accepts it, so a rejected heartbeat is resent on
//! the next tick and nothing is started twice.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use taskgrid_core::WorkerConfig;
use taskgrid_state::{AssignedTask, Resources, TaskId, TaskState, Worker, WorkerState};

use crate::client::WorkerClient;
use crate::controller::TaskController;
use crate::engine::ExecutionEngine;
use crate::error::{WorkerError, WorkerResult};
use crate::reconcile::{Action, LocalState, reconcile};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub started: Vec<TaskId>,
    pub canceled: Vec<TaskId>,
    pub unhandled: Vec<TaskId>,
    /// Controllers dropped after the heartbeat was accepted.
    pub removed: Vec<TaskId>,
    /// Worker version after the heartbeat.
    pub version: u64,
}

pub struct WorkerReconciler {
    id: String,
    zone: Option<String>,
    metadata: BTreeMap<String, String>,
    resources: Resources,
    log_tail_size: usize,
    rate: Duration,
    timeout: Duration,
    client: Arc<dyn WorkerClient>,
    engine: Arc<dyn ExecutionEngine>,
    controllers: HashMap<TaskId, TaskController>,
}

impl WorkerReconciler {
    pub fn new(
        config: &WorkerConfig,
        client: Arc<dyn WorkerClient>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> WorkerResult<Self> {
        Ok(Self {
            id: config.id.clone(),
            zone: config.zone.clone(),
            metadata: config.metadata.clone(),
            resources: detect_resources(config),
            log_tail_size: config.log_tail_size,
            rate: config.update_rate()?,
            timeout: config.update_timeout()?,
            client,
            engine,
            controllers: HashMap::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has_controller(&self, task_id: &str) -> bool {
        self.controllers.contains_key(task_id)
    }

    pub fn local_state(&self, task_id: &str) -> LocalState {
        self.controllers
            .get(task_id)
            .map(TaskController::local_state)
            .unwrap_or(LocalState::Unknown)
    }

    pub async fn tick(&mut self) -> WorkerResult<ReconcileReport> {
        let record = bounded(self.timeout, self.client.get_worker(&self.id)).await?;
        let (version, assigned) = match record {
            Some(worker) => (worker.version, worker.tasks),
            None => (0, BTreeMap::new()),
        };

        let mut report = ReconcileReport::default();
        let mut ids: BTreeSet<TaskId> = assigned.keys().cloned().collect();
        ids.extend(self.controllers.keys().cloned());

        for task_id in ids {
            let server = assigned
                .get(&task_id)
                .map(|t| t.state)
                .unwrap_or(TaskState::Unknown);
            let local = self.local_state(&task_id);

            match reconcile(server, local) {
                Action::Noop | Action::Update => {}
                Action::Start => {
                    let executors = assigned
                        .get(&task_id)
                        .map(|t| t.executors.clone())
                        .unwrap_or_default();
                    info!(worker_id = %self.id, %task_id, executors = executors.len(), "starting task");
                    let controller =
                        TaskController::start(task_id.clone(), executors, self.engine.clone());
                    self.controllers.insert(task_id.clone(), controller);
                    report.started.push(task_id);
                }
                Action::Cancel => {
                    if let Some(controller) = self.controllers.get(&task_id) {
                        debug!(worker_id = %self.id, %task_id, %server, "canceling task");
                        controller.cancel();
                    }
                    report.canceled.push(task_id);
                }
                Action::Unhandled => {
                    error!(
                        worker_id = %self.id,
                        %task_id,
                        %server,
                        ?local,
                        "unhandled reconcile state, canceling"
                    );
                    if let Some(controller) = self.controllers.get(&task_id) {
                        controller.cancel();
                    }
                    report.unhandled.push(task_id);
                }
            }
        }

        let heartbeat = self.heartbeat(version).await;
        let merged = bounded(self.timeout, self.client.update_worker(&heartbeat)).await?;

        for (task_id, reported) in &heartbeat.tasks {
            if reported.state.is_terminal() && self.controllers.remove(task_id).is_some() {
                report.removed.push(task_id.clone());
            }
        }
        report.version = merged.version;
        Ok(report)
    }

    /// Reconcile every `update_rate` until shutdown, then stop all
    /// executions.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, rate_ms = self.rate.as_millis() as u64, "worker started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.rate) => {
                    match self.tick().await {
                        Ok(report) => {
                            if !report.started.is_empty() || !report.removed.is_empty() {
                                debug!(
                                    worker_id = %self.id,
                                    started = report.started.len(),
                                    removed = report.removed.len(),
                                    running = self.controllers.len(),
                                    "reconciled"
                                );
                            }
                        }
                        Err(e) if e.is_retryable() => {
                            debug!(worker_id = %self.id, error = %e, "reconcile deferred");
                        }
                        Err(e) => warn!(worker_id = %self.id, error = %e, "reconcile failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!(worker_id = %self.id, "worker shutting down");
                    self.shutdown().await;
                    break;
                }
            }
        }
    }

    /// Cancel every execution and wait for them to stop.
    pub async fn shutdown(&mut self) {
        let controllers: Vec<TaskController> = self.controllers.drain().map(|(_, c)| c).collect();
        for controller in controllers {
            debug!(worker_id = %self.id, task_id = %controller.task_id(), "stopping task");
            controller.stop().await;
        }
    }

    async fn heartbeat(&self, version: u64) -> Worker {
        let mut tasks = BTreeMap::new();
        for (id, controller) in &self.controllers {
            let assigned = AssignedTask {
                state: controller.state(),
                logs: self.engine.logs(id, self.log_tail_size).await,
                ..Default::default()
            };
            tasks.insert(id.clone(), assigned);
        }

        let mut active_ports: Vec<u16> = self
            .controllers
            .values()
            .filter(|c| matches!(c.local_state(), LocalState::Active(_)))
            .flat_map(|c| c.ports().iter().copied())
            .collect();
        active_ports.sort_unstable();
        active_ports.dedup();

        Worker {
            id: self.id.clone(),
            state: WorkerState::Alive,
            resources: self.resources,
            zone: self.zone.clone(),
            metadata: self.metadata.clone(),
            tasks,
            active_ports,
            version,
            ..Default::default()
        }
    }
}

async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = WorkerResult<T>>,
) -> WorkerResult<T> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| WorkerError::Timeout(timeout))?
}

const BYTES_PER_GB: f64 = (1u64 << 30) as f64;

/// Configured capacity, with CPU count and total RAM read from the host
/// when left at zero.
fn detect_resources(config: &WorkerConfig) -> Resources {
    let mut cpu_cores = config.resources.cpu_cores;
    if cpu_cores == 0 {
        cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(0);
    }

    let mut ram_gb = config.resources.ram_gb;
    if ram_gb == 0.0 {
        let mut sys = System::new();
        sys.refresh_memory();
        ram_gb = sys.total_memory() as f64 / BYTES_PER_GB;
    }

    debug!(cpu_cores, ram_gb, disk_gb = config.resources.disk_gb, "worker capacity");
    Resources::new(cpu_cores, ram_gb, config.resources.disk_gb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LocalClient;
    use crate::engine::ProcessEngine;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use taskgrid_cluster::{ClusterError, WorkerRegistry};
    use taskgrid_state::{StateError, StateStore, Task, TaskStore};

    /// Client that can be told to reject heartbeats.
    struct FlakyClient {
        inner: LocalClient,
        reject: AtomicBool,
    }

    #[async_trait]
    impl WorkerClient for FlakyClient {
        async fn get_worker(&self, id: &str) -> WorkerResult<Option<Worker>> {
            self.inner.get_worker(id).await
        }

        async fn update_worker(&self, report: &Worker) -> WorkerResult<Worker> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(WorkerError::Cluster(ClusterError::State(
                    StateError::VersionConflict {
                        worker_id: report.id.clone(),
                        stored: report.version + 1,
                        submitted: report.version,
                    },
                )));
            }
            self.inner.update_worker(report).await
        }
    }

    struct Harness {
        store: Arc<dyn TaskStore>,
        registry: WorkerRegistry,
        client: Arc<FlakyClient>,
        reconciler: WorkerReconciler,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn TaskStore> = Arc::new(StateStore::open_in_memory().unwrap());
        let registry = WorkerRegistry::new(store.clone());
        let client = Arc::new(FlakyClient {
            inner: LocalClient::new(registry.clone()),
            reject: AtomicBool::new(false),
        });
        let config = WorkerConfig {
            id: "w1".into(),
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let engine = Arc::new(ProcessEngine::new(dir.path()));
        let reconciler = WorkerReconciler::new(&config, client.clone(), engine).unwrap();
        Harness {
            store,
            registry,
            client,
            reconciler,
            _dir: dir,
        }
    }

    impl Harness {
        /// Register the worker and hand it a task.
        async fn assign(&mut self, argv: &[&str]) -> TaskId {
            self.reconciler.tick().await.unwrap();
            let task = self
                .store
                .create_task(Task::new("t").with_executor(argv))
                .unwrap();
            let worker = self.registry.get_worker("w1").unwrap();
            self.store.assign_task(&task.id, &worker).unwrap();
            task.id
        }

        async fn wait_local(&self, task_id: &str, want: LocalState) {
            for _ in 0..200 {
                if self.reconciler.local_state(task_id) == want {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("task {task_id} never reached {want:?}");
        }
    }

    #[tokio::test]
    async fn first_tick_registers_worker() {
        let mut h = harness();
        let report = h.reconciler.tick().await.unwrap();
        assert_eq!(report.version, 1);

        let worker = h.registry.get_worker("w1").unwrap();
        assert_eq!(worker.state, WorkerState::Alive);
        assert!(worker.resources.cpu_cores > 0);
    }

    #[tokio::test]
    async fn assigned_task_runs_to_complete() {
        let mut h = harness();
        let task_id = h.assign(&["true"]).await;

        let report = h.reconciler.tick().await.unwrap();
        assert_eq!(report.started, vec![task_id.clone()]);

        h.wait_local(&task_id, LocalState::Complete(TaskState::Complete))
            .await;
        let report = h.reconciler.tick().await.unwrap();
        assert_eq!(report.removed, vec![task_id.clone()]);
        assert!(!h.reconciler.has_controller(&task_id));

        let task = h.store.get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Complete);
        assert!(h.registry.get_worker("w1").unwrap().tasks.is_empty());
    }

    #[tokio::test]
    async fn executor_output_reaches_task_log() {
        let mut h = harness();
        let task_id = h.assign(&["sh", "-c", "echo hello; echo warn >&2; exit 2"]).await;
        h.reconciler.tick().await.unwrap();

        h.wait_local(&task_id, LocalState::Complete(TaskState::Error))
            .await;
        h.reconciler.tick().await.unwrap();

        let task = h.store.get_task(&task_id).unwrap().unwrap();
        let logs = &task.logs[0].executor_logs;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].exit_code, Some(2));
        assert_eq!(logs[0].stdout, "hello\n");
        assert_eq!(logs[0].stderr, "warn\n");
    }

    #[tokio::test]
    async fn failing_task_reports_error() {
        let mut h = harness();
        let task_id = h.assign(&["false"]).await;
        h.reconciler.tick().await.unwrap();

        h.wait_local(&task_id, LocalState::Complete(TaskState::Error))
            .await;
        h.reconciler.tick().await.unwrap();
        let task = h.store.get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Error);
    }

    #[tokio::test]
    async fn server_cancel_removes_controller_within_one_tick() {
        let mut h = harness();
        let task_id = h.assign(&["sleep", "30"]).await;
        h.reconciler.tick().await.unwrap();
        assert!(h.reconciler.has_controller(&task_id));

        h.store
            .transition_task(&task_id, TaskState::Canceled)
            .unwrap();
        let report = h.reconciler.tick().await.unwrap();
        assert_eq!(report.canceled, vec![task_id.clone()]);
        assert_eq!(report.removed, vec![task_id.clone()]);
        assert!(!h.reconciler.has_controller(&task_id));

        let task = h.store.get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Canceled);
        assert!(h.registry.get_worker("w1").unwrap().tasks.is_empty());
    }

    #[tokio::test]
    async fn rejected_heartbeat_keeps_controllers() {
        let mut h = harness();
        let task_id = h.assign(&["sleep", "30"]).await;
        h.reconciler.tick().await.unwrap();
        h.store
            .transition_task(&task_id, TaskState::Canceled)
            .unwrap();

        h.client.reject.store(true, Ordering::SeqCst);
        let err = h.reconciler.tick().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(h.reconciler.has_controller(&task_id));

        // Retried on the next tick; nothing is started again.
        h.client.reject.store(false, Ordering::SeqCst);
        let report = h.reconciler.tick().await.unwrap();
        assert!(report.started.is_empty());
        assert_eq!(report.removed, vec![task_id.clone()]);
    }

    #[tokio::test]
    async fn running_task_is_not_started_twice() {
        let mut h = harness();
        let task_id = h.assign(&["sleep", "30"]).await;
        assert_eq!(h.reconciler.tick().await.unwrap().started.len(), 1);

        h.wait_local(&task_id, LocalState::Active(TaskState::Running))
            .await;
        let report = h.reconciler.tick().await.unwrap();
        assert!(report.started.is_empty());
        assert_eq!(
            h.store.get_task(&task_id).unwrap().unwrap().state,
            TaskState::Running
        );
        h.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn server_terminal_with_local_run_is_unhandled() {
        let mut h = harness();
        let task_id = h.assign(&["sleep", "30"]).await;
        h.reconciler.tick().await.unwrap();

        h.store
            .transition_task(&task_id, TaskState::Complete)
            .unwrap();
        let report = h.reconciler.tick().await.unwrap();
        assert_eq!(report.unhandled, vec![task_id.clone()]);
        assert_eq!(report.removed, vec![task_id.clone()]);

        // The server keeps its terminal state.
        let task = h.store.get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Complete);
    }

    #[tokio::test]
    async fn shutdown_cancels_executions() {
        let mut h = harness();
        let task_id = h.assign(&["sleep", "30"]).await;
        h.reconciler.tick().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), h.reconciler.shutdown())
            .await
            .unwrap();
        assert!(!h.reconciler.has_controller(&task_id));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.reconciler.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn configured_resources_are_kept() {
        let mut config = WorkerConfig::default();
        config.resources.cpu_cores = 3;
        config.resources.ram_gb = 12.0;
        assert_eq!(detect_resources(&config), Resources::new(3, 12.0, 100.0));
    }

    #[test]
    fn unset_capacity_is_detected() {
        let resources = detect_resources(&WorkerConfig::default());
        assert!(resources.cpu_cores > 0);
        assert!(resources.ram_gb > 0.0);
        assert_eq!(resources.disk_gb, 100.0);
    }
}
