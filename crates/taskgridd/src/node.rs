use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use taskgrid_cluster::WorkerRegistry;
use taskgrid_core::GridConfig;
use taskgrid_scheduler::{BackendRegistry, RecoverySweep, SchedulingLoop};
use taskgrid_state::{StateStore, TaskStore};
use taskgrid_worker::{LocalClient, ProcessEngine, WorkerReconciler};

const DB_FILE: &str = "taskgrid.redb";

pub struct Node {
    config: GridConfig,
    store: Arc<dyn TaskStore>,
    registry: WorkerRegistry,
    backends: Arc<BackendRegistry>,
}

impl Node {
    /// Open (or create) the store under `data_dir`. A relative worker
    /// work dir is resolved against `data_dir` too.
    pub fn open(mut config: GridConfig, data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        if config.worker.work_dir.is_relative() {
            config.worker.work_dir = data_dir.join(&config.worker.work_dir);
        }

        let db_path = data_dir.join(DB_FILE);
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        Self::build(config, Arc::new(store))
    }

    pub fn in_memory(config: GridConfig) -> anyhow::Result<Self> {
        Self::build(config, Arc::new(StateStore::open_in_memory()?))
    }

    fn build(config: GridConfig, store: Arc<dyn TaskStore>) -> anyhow::Result<Self> {
        config.validate()?;
        let registry = WorkerRegistry::new(store.clone())
            .with_init_timeout(config.scheduler.node_init_timeout()?)
            .with_dead_timeout(config.scheduler.node_dead_timeout()?);
        let backends = Arc::new(BackendRegistry::with_defaults(store.clone()));
        info!(
            backend = %config.scheduler.backend,
            available = ?backends.names(),
            "backends registered"
        );
        Ok(Self {
            config,
            store,
            registry,
            backends,
        })
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Run every loop until `shutdown` fires or the scheduler gives up.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let scheduler = SchedulingLoop::new(self.registry.clone(), self.backends, &self.config)?;
        let recovery = RecoverySweep::new(self.store.clone(), &self.config)?;

        std::fs::create_dir_all(&self.config.worker.work_dir)?;
        let engine = Arc::new(ProcessEngine::new(&self.config.worker.work_dir));
        let client = Arc::new(LocalClient::new(self.registry));
        let worker = WorkerReconciler::new(&self.config.worker, client, engine)?;
        info!(
            worker_id = %worker.id(),
            work_dir = ?self.config.worker.work_dir,
            "local worker initialized"
        );

        // ── Background loops ───────────────────────────────────────
        let (stop_tx, stop_rx) = watch::channel(false);
        let recovery_handle = tokio::spawn(recovery.run(stop_rx.clone()));
        let worker_handle = tokio::spawn(worker.run(stop_rx.clone()));
        let mut scheduler_handle = tokio::spawn(scheduler.run(stop_rx));

        let early = tokio::select! {
            joined = &mut scheduler_handle => Some(joined),
            _ = shutdown.changed() => None,
        };
        stop_tx.send_replace(true);
        let joined = match early {
            Some(joined) => {
                warn!("scheduler stopped, shutting down");
                joined
            }
            None => scheduler_handle.await,
        };

        if let Err(e) = recovery_handle.await {
            error!(error = %e, "recovery sweep task failed");
        }
        if let Err(e) = worker_handle.await {
            error!(error = %e, "local worker task failed");
        }
        info!("TaskGrid node stopped");

        joined??;
        Ok(())
    }
}
