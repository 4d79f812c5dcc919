//! The batch backend: one batch-queue job per task.
//!
//! Every task gets a fresh template worker sized exactly to its request.
//! Accepting the offer submits a job (through the configured command) that
//! starts a worker under the offered id.

use anyhow::bail;
use async_trait::async_trait;
use taskgrid_core::GridConfig;
use taskgrid_placement::{DEFAULT_PREDICATES, Offer, Weights, select_offer};
use taskgrid_state::{Task, Worker};
use tracing::info;

use super::{provisional_id, run_command};
use crate::backend::Backend;

pub struct BatchBackend {
    submit_command: Vec<String>,
    zone: Option<String>,
    weights: Weights,
}

impl BatchBackend {
    pub fn new(config: &GridConfig) -> anyhow::Result<Self> {
        let batch = &config.scheduler.batch;
        if batch.submit_command.is_empty() {
            bail!("batch backend requires scheduler.batch.submit_command");
        }
        Ok(Self {
            submit_command: batch.submit_command.clone(),
            zone: batch.zone.clone(),
            weights: config.scheduler.weights.clone(),
        })
    }
}

#[async_trait]
impl Backend for BatchBackend {
    fn name(&self) -> &str {
        "batch"
    }

    async fn schedule(&self, task: &Task) -> Option<Offer> {
        let mut worker = Worker::template(provisional_id("batch"), "batch", task.resources.request());
        worker.zone = self.zone.clone();

        let offer = select_offer(
            task,
            std::slice::from_ref(&worker),
            DEFAULT_PREDICATES,
            &self.weights,
        )?;

        let command = self.submit_command.clone();
        let worker_id = offer.worker.id.clone();
        let task_id = task.id.clone();
        Some(offer.with_accept(move || async move {
            info!(%worker_id, %task_id, "submitting batch job");
            run_command(
                &command,
                &[
                    ("TASKGRID_WORKER_ID", worker_id.as_str()),
                    ("TASKGRID_TASK_ID", task_id.as_str()),
                ],
            )
            .await
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &[&str]) -> GridConfig {
        let mut config = GridConfig::default();
        config.scheduler.batch.submit_command = command.iter().map(|s| s.to_string()).collect();
        config
    }

    #[tokio::test]
    async fn offer_is_sized_to_the_request() {
        let backend = BatchBackend::new(&config(&["true"])).unwrap();
        let task = Task::new("t").with_resources(8, 32.0, 200.0);

        let mut offer = backend.schedule(&task).await.unwrap();
        assert!(offer.worker.is_template());
        assert!(offer.worker.id.starts_with("batch-"));
        assert_eq!(offer.worker.resources, task.resources.request());

        let accept = offer.accept.take().unwrap();
        accept().await.unwrap();
    }

    #[tokio::test]
    async fn failed_submission_fails_accept() {
        let backend = BatchBackend::new(&config(&["false"])).unwrap();
        let mut offer = backend.schedule(&Task::new("t")).await.unwrap();
        let accept = offer.accept.take().unwrap();
        assert!(accept().await.is_err());
    }

    #[tokio::test]
    async fn zone_restricted_task_needs_matching_zone() {
        let mut config = config(&["true"]);
        config.scheduler.batch.zone = Some("cluster-a".into());
        let backend = BatchBackend::new(&config).unwrap();

        let mut task = Task::new("t");
        task.resources.zones = vec!["cluster-b".into()];
        assert!(backend.schedule(&task).await.is_none());

        task.resources.zones.push("cluster-a".into());
        assert!(backend.schedule(&task).await.is_some());
    }

    #[test]
    fn submit_command_is_required() {
        assert!(BatchBackend::new(&GridConfig::default()).is_err());
    }
}
