//! The fleet backend: a pool of cloud VMs plus templates for more.
//!
//! Existing fleet workers are marked with `metadata["fleet"]`. Every
//! configured template is offered as a candidate too; if a template wins,
//! the offer's accept callback provisions the VM before the task is
//! assigned to it.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use taskgrid_core::{GridConfig, WorkerTemplate};
use taskgrid_placement::{DEFAULT_PREDICATES, Offer, Weights, select_offer};
use taskgrid_state::{Resources, TEMPLATE_KEY, Task, TaskStore, Worker};
use tracing::info;

use super::{provisional_id, run_command, stored_workers};
use crate::backend::Backend;

/// Worker metadata key naming the template a fleet worker came from.
pub const FLEET_KEY: &str = "fleet";

/// Task tag selecting a placement strategy. `pack` only uses existing VMs.
pub const STRATEGY_TAG: &str = "strategy";

/// Brings a template worker into existence.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, worker: &Worker) -> anyhow::Result<()>;
}

/// Provisions by running a configured command with `TASKGRID_WORKER_ID`
/// and `TASKGRID_TEMPLATE` set.
pub struct CommandProvisioner {
    command: Vec<String>,
}

impl CommandProvisioner {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn provision(&self, worker: &Worker) -> anyhow::Result<()> {
        let template = worker
            .metadata
            .get(TEMPLATE_KEY)
            .map(String::as_str)
            .unwrap_or_default();
        info!(worker_id = %worker.id, %template, "provisioning fleet worker");
        run_command(
            &self.command,
            &[
                ("TASKGRID_WORKER_ID", worker.id.as_str()),
                ("TASKGRID_TEMPLATE", template),
            ],
        )
        .await
    }
}

pub struct FleetBackend {
    store: Arc<dyn TaskStore>,
    templates: Vec<WorkerTemplate>,
    provisioner: Arc<dyn Provisioner>,
    weights: Weights,
}

impl FleetBackend {
    /// Build with a [`CommandProvisioner`]. Templates without a provision
    /// command are a configuration error.
    pub fn new(store: Arc<dyn TaskStore>, config: &GridConfig) -> anyhow::Result<Self> {
        let fleet = &config.scheduler.fleet;
        if !fleet.templates.is_empty() && fleet.provision_command.is_empty() {
            bail!("fleet templates are configured but scheduler.fleet.provision_command is empty");
        }
        let provisioner = Arc::new(CommandProvisioner::new(fleet.provision_command.clone()));
        Ok(Self::with_provisioner(store, config, provisioner))
    }

    pub fn with_provisioner(
        store: Arc<dyn TaskStore>,
        config: &GridConfig,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            store,
            templates: config.scheduler.fleet.templates.clone(),
            provisioner,
            weights: config.scheduler.weights.clone(),
        }
    }

    fn template_worker(template: &WorkerTemplate) -> Worker {
        let resources = Resources::new(template.cpu_cores, template.ram_gb, template.disk_gb);
        let mut worker = Worker::template(provisional_id(&template.id), &template.id, resources);
        worker.zone = template.zone.clone();
        worker.metadata.extend(template.metadata.clone());
        worker
            .metadata
            .insert(FLEET_KEY.to_string(), template.id.clone());
        worker
    }
}

#[async_trait]
impl Backend for FleetBackend {
    fn name(&self) -> &str {
        "fleet"
    }

    async fn schedule(&self, task: &Task) -> Option<Offer> {
        let mut workers: Vec<Worker> = stored_workers(self.store.as_ref(), self.name())
            .into_iter()
            .filter(|w| w.metadata.contains_key(FLEET_KEY))
            .collect();
        let existing: HashSet<String> = workers.iter().map(|w| w.id.clone()).collect();

        let pack = task.tags.get(STRATEGY_TAG).is_some_and(|s| s == "pack");
        if !pack {
            workers.extend(self.templates.iter().map(Self::template_worker));
        }

        let offer = select_offer(task, &workers, DEFAULT_PREDICATES, &self.weights)?;
        if existing.contains(&offer.worker.id) {
            return Some(offer);
        }

        let provisioner = self.provisioner.clone();
        let worker = offer.worker.clone();
        Some(offer.with_accept(move || async move { provisioner.provision(&worker).await }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use taskgrid_placement::STARTUP_COST;
    use taskgrid_state::{StateStore, WorkerState};

    #[derive(Default)]
    struct RecordingProvisioner {
        provisioned: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Provisioner for RecordingProvisioner {
        async fn provision(&self, worker: &Worker) -> anyhow::Result<()> {
            self.provisioned.lock().unwrap().push(worker.id.clone());
            Ok(())
        }
    }

    fn config() -> GridConfig {
        let mut config = GridConfig::default();
        config.scheduler.weights.insert(STARTUP_COST.to_string(), 1.0);
        config.scheduler.fleet.templates.push(WorkerTemplate {
            id: "n1-standard-4".into(),
            cpu_cores: 4,
            ram_gb: 15.0,
            disk_gb: 100.0,
            zone: Some("us-east1-b".into()),
            ..Default::default()
        });
        config
    }

    fn setup() -> (Arc<dyn TaskStore>, Arc<RecordingProvisioner>, FleetBackend) {
        let store: Arc<dyn TaskStore> = Arc::new(StateStore::open_in_memory().unwrap());
        let provisioner = Arc::new(RecordingProvisioner::default());
        let backend = FleetBackend::with_provisioner(store.clone(), &config(), provisioner.clone());
        (store, provisioner, backend)
    }

    #[tokio::test]
    async fn template_offer_provisions_on_accept() {
        let (_store, provisioner, backend) = setup();
        let task = Task::new("t").with_resources(2, 4.0, 10.0);

        let mut offer = backend.schedule(&task).await.unwrap();
        assert!(offer.worker.is_template());
        assert!(offer.worker.id.starts_with("n1-standard-4-"));
        assert_eq!(offer.worker.zone.as_deref(), Some("us-east1-b"));

        let accept = offer.accept.take().unwrap();
        accept().await.unwrap();
        assert_eq!(*provisioner.provisioned.lock().unwrap(), vec![offer.worker.id]);
    }

    #[tokio::test]
    async fn existing_fleet_worker_preferred_without_provisioning() {
        let (store, _provisioner, backend) = setup();
        let mut vm = Worker::new("vm-1", Resources::new(4, 15.0, 100.0));
        vm.state = WorkerState::Alive;
        vm.metadata.insert(FLEET_KEY.into(), "n1-standard-4".into());
        store.put_worker(&vm).unwrap();

        let task = Task::new("t").with_resources(2, 4.0, 10.0);
        let offer = backend.schedule(&task).await.unwrap();
        assert_eq!(offer.worker.id, "vm-1");
        assert!(offer.accept.is_none());
    }

    #[tokio::test]
    async fn non_fleet_workers_are_ignored() {
        let (store, _provisioner, backend) = setup();
        let mut other = Worker::new("laptop", Resources::new(64, 256.0, 1000.0));
        other.state = WorkerState::Alive;
        store.put_worker(&other).unwrap();

        let task = Task::new("t").with_resources(2, 4.0, 10.0);
        let offer = backend.schedule(&task).await.unwrap();
        assert_ne!(offer.worker.id, "laptop");
    }

    #[tokio::test]
    async fn pack_strategy_skips_templates() {
        let (_store, _provisioner, backend) = setup();
        let task = Task::new("t")
            .with_resources(2, 4.0, 10.0)
            .with_tag(STRATEGY_TAG, "pack");
        assert!(backend.schedule(&task).await.is_none());
    }

    #[test]
    fn templates_need_a_provision_command() {
        let store: Arc<dyn TaskStore> = Arc::new(StateStore::open_in_memory().unwrap());
        assert!(FleetBackend::new(store.clone(), &config()).is_err());

        let mut with_command = config();
        with_command.scheduler.fleet.provision_command = vec!["true".into()];
        assert!(FleetBackend::new(store, &with_command).is_ok());
    }
}
