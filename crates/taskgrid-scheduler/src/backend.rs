//! The backend capability and the registry that resolves backends by name.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use taskgrid_core::GridConfig;
use taskgrid_placement::Offer;
use taskgrid_state::{Task, TaskStore};
use tracing::info;

use crate::backends::{BatchBackend, FleetBackend, LocalBackend, ManualBackend};
use crate::error::{SchedulerError, SchedulerResult};

/// A source of compute capacity.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Propose a worker for `task`, or `None` if this backend has nothing
    /// that fits right now.
    async fn schedule(&self, task: &Task) -> Option<Offer>;
}

/// Builds a backend from the process configuration.
pub type BackendConstructor =
    Box<dyn Fn(&GridConfig) -> anyhow::Result<Arc<dyn Backend>> + Send + Sync>;

/// Name → constructor map with a per-process cache of built backends.
///
/// Names are case-insensitive. A backend is constructed on its first
/// `resolve` and reused afterwards; a failed construction is not cached,
/// so the next call tries again.
pub struct BackendRegistry {
    constructors: BTreeMap<String, BackendConstructor>,
    cache: Mutex<HashMap<String, Arc<dyn Backend>>>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// A registry with the built-in `local`, `manual`, `fleet` and `batch`
    /// backends, all reading workers from `store`.
    pub fn with_defaults(store: Arc<dyn TaskStore>) -> Self {
        let mut registry = Self::new();

        let s = store.clone();
        registry.register("local", move |config| {
            Ok(Arc::new(LocalBackend::new(s.clone(), config)) as Arc<dyn Backend>)
        });

        let s = store.clone();
        registry.register("manual", move |config| {
            Ok(Arc::new(ManualBackend::new(s.clone(), config)) as Arc<dyn Backend>)
        });

        let s = store;
        registry.register("fleet", move |config| {
            Ok(Arc::new(FleetBackend::new(s.clone(), config)?) as Arc<dyn Backend>)
        });

        registry.register("batch", |config| {
            Ok(Arc::new(BatchBackend::new(config)?) as Arc<dyn Backend>)
        });

        registry
    }

    /// Add or replace a constructor.
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&GridConfig) -> anyhow::Result<Arc<dyn Backend>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_ascii_lowercase(), Box::new(constructor));
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }

    /// The backend registered under `name`, constructing it on first use.
    pub fn resolve(&self, name: &str, config: &GridConfig) -> SchedulerResult<Arc<dyn Backend>> {
        let key = name.to_ascii_lowercase();
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(backend) = cache.get(&key) {
            return Ok(backend.clone());
        }

        let constructor = self
            .constructors
            .get(&key)
            .ok_or_else(|| SchedulerError::UnknownBackend(name.to_string()))?;
        let backend = constructor(config).map_err(|source| SchedulerError::BackendConstruction {
            name: key.clone(),
            source,
        })?;
        info!(backend = %key, "backend initialized");
        cache.insert(key, backend.clone());
        Ok(backend)
    }
}
