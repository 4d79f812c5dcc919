//! The local backend offers the worker running inside the daemon.

use std::sync::Arc;

use async_trait::async_trait;
use taskgrid_core::GridConfig;
use taskgrid_placement::{DEFAULT_PREDICATES, Offer, Weights, select_offer};
use taskgrid_state::{Task, TaskStore};
use tracing::{debug, warn};

use crate::backend::Backend;

pub struct LocalBackend {
    store: Arc<dyn TaskStore>,
    worker_id: String,
    weights: Weights,
}

impl LocalBackend {
    pub fn new(store: Arc<dyn TaskStore>, config: &GridConfig) -> Self {
        Self {
            store,
            worker_id: config.scheduler.local.worker_id.clone(),
            weights: config.scheduler.weights.clone(),
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn schedule(&self, task: &Task) -> Option<Offer> {
        let worker = match self.store.get_worker(&self.worker_id) {
            Ok(Some(worker)) => worker,
            Ok(None) => {
                debug!(worker_id = %self.worker_id, "local worker has not checked in yet");
                return None;
            }
            Err(e) => {
                warn!(worker_id = %self.worker_id, error = %e, "failed to load local worker");
                return None;
            }
        };
        select_offer(
            task,
            std::slice::from_ref(&worker),
            DEFAULT_PREDICATES,
            &self.weights,
        )
    }
}
