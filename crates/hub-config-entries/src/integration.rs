//! Integration and platform contracts
//!
//! An [`Integration`] turns a config entry into running coordinators and
//! entities. It declares its entity platforms once, at registration; setup
//! then forwards to them by [`PlatformDomain`].

use crate::entry::ConfigEntry;
use crate::error::ConfigEntryError;
use crate::runtime::EntryHandle;
use async_trait::async_trait;
use dashmap::DashMap;
use hub_core::PlatformDomain;
use hub_entity::AddEntities;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Entity platform of an integration (its sensors, its switches, ...)
#[async_trait]
pub trait Platform: Send + Sync + 'static {
    /// Create the platform's entities for `entry` and publish them through
    /// `add_entities`
    async fn setup_entry(
        &self,
        entry: &EntryHandle,
        add_entities: AddEntities,
    ) -> Result<(), ConfigEntryError>;

    /// Release platform resources; entities are removed by the hub afterwards
    async fn unload_entry(&self, _entry: &EntryHandle) -> Result<bool, ConfigEntryError> {
        Ok(true)
    }
}

#[async_trait]
pub trait Integration: Send + Sync + 'static {
    fn domain(&self) -> &str;

    /// Current schema version of this integration's entries
    fn version(&self) -> u32 {
        1
    }

    /// Reload loaded entries whenever their data or options change
    fn reload_on_update(&self) -> bool {
        false
    }

    fn platforms(&self) -> Vec<(PlatformDomain, Arc<dyn Platform>)> {
        Vec::new()
    }

    /// Bring an older entry up to [`Integration::version`]
    async fn migrate_entry(&self, entry: &mut ConfigEntry) -> Result<(), ConfigEntryError> {
        Err(ConfigEntryError::failed(format!(
            "no migration from version {}",
            entry.version
        )))
    }

    async fn setup_entry(&self, entry: &EntryHandle) -> Result<(), ConfigEntryError>;

    /// Default: unload every platform that was forwarded during setup
    async fn unload_entry(&self, entry: &EntryHandle) -> Result<bool, ConfigEntryError> {
        Ok(entry.unload_platforms(&entry.loaded_platforms()).await)
    }
}

/// An integration with its platforms resolved
pub struct LoadedIntegration {
    integration: Arc<dyn Integration>,
    platforms: HashMap<PlatformDomain, Arc<dyn Platform>>,
}

impl LoadedIntegration {
    pub fn domain(&self) -> &str {
        self.integration.domain()
    }

    pub fn integration(&self) -> &Arc<dyn Integration> {
        &self.integration
    }

    pub fn platform(&self, domain: PlatformDomain) -> Option<Arc<dyn Platform>> {
        self.platforms.get(&domain).cloned()
    }

    pub fn platform_domains(&self) -> Vec<PlatformDomain> {
        let mut domains: Vec<_> = self.platforms.keys().copied().collect();
        domains.sort();
        domains
    }
}

/// Integrations known to the hub, by domain
#[derive(Default)]
pub struct IntegrationRegistry {
    integrations: DashMap<String, Arc<LoadedIntegration>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an integration; a second registration for the same domain
    /// replaces the first
    pub fn register(&self, integration: Arc<dyn Integration>) {
        let domain = integration.domain().to_string();
        let platforms: HashMap<_, _> = integration.platforms().into_iter().collect();
        debug!(
            domain = %domain,
            platforms = ?platforms.keys().collect::<Vec<_>>(),
            "Registered integration"
        );
        let loaded = Arc::new(LoadedIntegration {
            integration,
            platforms,
        });
        if self.integrations.insert(domain.clone(), loaded).is_some() {
            warn!(domain = %domain, "Integration registered twice, replacing");
        }
    }

    pub fn get(&self, domain: &str) -> Option<Arc<LoadedIntegration>> {
        self.integrations.get(domain).map(|i| Arc::clone(i.value()))
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.integrations.contains_key(domain)
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<_> = self.integrations.iter().map(|i| i.key().clone()).collect();
        domains.sort();
        domains
    }
}
