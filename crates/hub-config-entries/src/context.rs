//! Hub context
//!
//! Everything an integration needs from the hub, passed explicitly to every
//! setup and teardown call.

use hub_config::HubConfig;
use hub_coordinator::CoordinatorSettings;
use hub_core::{EventBus, SharedEventBus};
use hub_entity::{EntityComponent, EntityServices, SharedStateStore, StateStore};
use hub_registries::{EntityRegistry, Storage, StorageResult};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("blocking executor is closed")]
    Closed,

    #[error("blocking job failed: {0}")]
    Join(#[from] JoinError),
}

pub struct HubContext {
    config: HubConfig,
    bus: SharedEventBus,
    states: SharedStateStore,
    storage: Arc<Storage>,
    registry: Arc<EntityRegistry>,
    component: Arc<EntityComponent>,
    blocking: Arc<Semaphore>,
}

impl HubContext {
    pub fn new(config: HubConfig) -> Arc<Self> {
        let bus: SharedEventBus = Arc::new(EventBus::new());
        let storage = Arc::new(Storage::new(&config.config_dir));
        let blocking = Arc::new(Semaphore::new(config.executor.max_blocking_workers.max(1)));
        Arc::new(Self {
            states: Arc::new(StateStore::new(Arc::clone(&bus))),
            registry: Arc::new(EntityRegistry::new(Arc::clone(&storage))),
            component: Arc::new(EntityComponent::new()),
            bus,
            storage,
            blocking,
            config,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }

    pub fn states(&self) -> &SharedStateStore {
        &self.states
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn entity_registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn entities(&self) -> &Arc<EntityComponent> {
        &self.component
    }

    pub fn entity_services(&self) -> EntityServices {
        EntityServices {
            states: Arc::clone(&self.states),
            registry: Arc::clone(&self.registry),
            component: Arc::clone(&self.component),
        }
    }

    /// Coordinator defaults from `hub.yaml`
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        self.config.coordinator.settings()
    }

    /// Run a blocking call on the bounded worker pool
    pub async fn run_blocking<F, R>(&self, f: F) -> Result<R, ExecutorError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.blocking)
            .acquire_owned()
            .await
            .map_err(|_| ExecutorError::Closed)?;
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await?;
        Ok(result)
    }

    pub async fn load_registries(&self) -> StorageResult<()> {
        self.registry.load().await?;
        debug!("Loaded {} entity registry entries", self.registry.len());
        Ok(())
    }

    pub async fn save_registries(&self) -> StorageResult<()> {
        self.registry.save().await
    }
}
