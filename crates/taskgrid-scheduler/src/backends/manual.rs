//! The manual backend schedules onto workers someone else started.
//!
//! It never provisions: only live, already-registered workers are offered.

use std::sync::Arc;

use async_trait::async_trait;
use taskgrid_core::GridConfig;
use taskgrid_placement::{DEFAULT_PREDICATES, Offer, Weights, select_offer};
use taskgrid_state::{Task, TaskStore, WorkerState};

use super::stored_workers;
use crate::backend::Backend;

pub struct ManualBackend {
    store: Arc<dyn TaskStore>,
    weights: Weights,
}

impl ManualBackend {
    pub fn new(store: Arc<dyn TaskStore>, config: &GridConfig) -> Self {
        Self {
            store,
            weights: config.scheduler.weights.clone(),
        }
    }
}

#[async_trait]
impl Backend for ManualBackend {
    fn name(&self) -> &str {
        "manual"
    }

    async fn schedule(&self, task: &Task) -> Option<Offer> {
        let workers: Vec<_> = stored_workers(self.store.as_ref(), self.name())
            .into_iter()
            .filter(|w| w.state == WorkerState::Alive && !w.is_template())
            .collect();
        select_offer(task, &workers, DEFAULT_PREDICATES, &self.weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgrid_state::{Resources, StateStore, Worker};

    #[tokio::test]
    async fn skips_templates_and_workers_not_alive() {
        let store: Arc<dyn TaskStore> = Arc::new(StateStore::open_in_memory().unwrap());
        let backend = ManualBackend::new(store.clone(), &GridConfig::default());

        let mut booting = Worker::new("booting", Resources::new(4, 8.0, 100.0));
        booting.state = WorkerState::Initializing;
        store.put_worker(&booting).unwrap();
        let mut template = Worker::template("tmpl", "n1", Resources::new(4, 8.0, 100.0));
        template.state = WorkerState::Alive;
        store.put_worker(&template).unwrap();

        let task = Task::new("t").with_resources(1, 1.0, 0.0);
        assert!(backend.schedule(&task).await.is_none());

        let mut alive = Worker::new("alive", Resources::new(4, 8.0, 100.0));
        alive.state = WorkerState::Alive;
        store.put_worker(&alive).unwrap();
        assert_eq!(backend.schedule(&task).await.unwrap().worker.id, "alive");
    }
}
