//! Config entries manager
//!
//! Owns every config entry, persists them, and drives their lifecycle:
//! setup with retry, migration, unload, reload and removal. Each entry has
//! its own setup lock, so a slow or failing entry never blocks the others.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use hub_config::EntryConfig;
use hub_core::events::{ConfigEntryReauthData, ConfigEntryStateChangedData};
use hub_core::Context;
use hub_registries::{Storable, StorageResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::context::HubContext;
use crate::entry::{
    ConfigEntry, ConfigEntryDisabledBy, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate,
};
use crate::error::{ConfigEntriesError, ConfigEntriesResult, ConfigEntryError};
use crate::integration::{IntegrationRegistry, LoadedIntegration};
use crate::runtime::{EntryHandle, ReauthTrigger};
use crate::state_machine::retry_delay;

/// Storage key for config entries
pub const STORAGE_KEY: &str = "core.config_entries";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Persisted form of all config entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    pub entries: Vec<ConfigEntry>,
}

impl Storable for ConfigEntriesData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

struct ManagerInner {
    hub: Arc<HubContext>,
    integrations: Arc<IntegrationRegistry>,

    /// Primary index: entry_id -> ConfigEntry
    entries: DashMap<String, ConfigEntry>,
    /// domain -> entry_ids
    by_domain: DashMap<String, HashSet<String>>,
    /// (domain, unique_id) -> entry_id
    by_unique_id: DashMap<(String, String), String>,

    /// Runtime of every loaded entry
    runtimes: DashMap<String, EntryHandle>,
    /// Pending setup retries
    retries: DashMap<String, JoinHandle<()>>,
    shutting_down: AtomicBool,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for retry in self.retries.iter() {
            retry.abort();
        }
    }
}

/// Config entries manager; cheap to clone
#[derive(Clone)]
pub struct ConfigEntries {
    inner: Arc<ManagerInner>,
}

impl ConfigEntries {
    pub fn new(hub: Arc<HubContext>, integrations: Arc<IntegrationRegistry>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                hub,
                integrations,
                entries: DashMap::new(),
                by_domain: DashMap::new(),
                by_unique_id: DashMap::new(),
                runtimes: DashMap::new(),
                retries: DashMap::new(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    fn from_weak(weak: &Weak<ManagerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn hub(&self) -> &Arc<HubContext> {
        &self.inner.hub
    }

    pub fn integrations(&self) -> &Arc<IntegrationRegistry> {
        &self.inner.integrations
    }

    // ==================== Storage ====================

    pub async fn load(&self) -> StorageResult<()> {
        let storage = self.inner.hub.storage();
        if let Some(data) = storage.load_document::<ConfigEntriesData>().await? {
            info!("Loading {} config entries from storage", data.entries.len());
            for entry in data.entries {
                self.index_entry(entry);
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let mut entries: Vec<_> = self.inner.entries.iter().map(|r| r.value().clone()).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let count = entries.len();

        self.inner
            .hub
            .storage()
            .save_document(&ConfigEntriesData { entries })
            .await?;
        debug!("Saved {} config entries to storage", count);
        Ok(())
    }

    fn index_entry(&self, entry: ConfigEntry) {
        let entry_id = entry.entry_id.clone();
        self.inner
            .by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry_id.clone());
        if let Some(unique_id) = &entry.unique_id {
            self.inner
                .by_unique_id
                .insert((entry.domain.clone(), unique_id.clone()), entry_id.clone());
        }
        self.inner.entries.insert(entry_id, entry);
    }

    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.inner.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }
        if let Some(unique_id) = &entry.unique_id {
            self.inner
                .by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }
        self.inner.entries.remove(&entry.entry_id);
    }

    // ==================== Queries ====================

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.inner.entries.get(entry_id).map(|r| r.value().clone())
    }

    /// Entries of a domain, oldest first
    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        let ids: Vec<String> = self
            .inner
            .by_domain
            .get(domain)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        let mut entries: Vec<_> = ids.iter().filter_map(|id| self.get(id)).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries
    }

    pub fn get_loaded_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        self.get_by_domain(domain)
            .into_iter()
            .filter(|e| e.is_loaded())
            .collect()
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        let entry_id = self
            .inner
            .by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))
            .map(|id| id.value().clone())?;
        self.get(&entry_id)
    }

    pub fn state(&self, entry_id: &str) -> Option<ConfigEntryState> {
        self.inner.entries.get(entry_id).map(|e| e.state)
    }

    /// Runtime of a loaded entry
    pub fn runtime(&self, entry_id: &str) -> Option<EntryHandle> {
        self.inner.runtimes.get(entry_id).map(|h| h.value().clone())
    }

    pub fn has_pending_retry(&self, entry_id: &str) -> bool {
        self.inner.retries.contains_key(entry_id)
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.inner.entries.iter().map(|r| r.key().clone()).collect()
    }

    pub fn domains(&self) -> Vec<String> {
        self.inner
            .by_domain
            .iter()
            .filter(|r| !r.value().is_empty())
            .map(|r| r.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn iter(&self) -> Vec<ConfigEntry> {
        self.inner.entries.iter().map(|r| r.value().clone()).collect()
    }

    // ==================== Records ====================

    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(unique_id) = &entry.unique_id {
            if self.get_by_unique_id(&entry.domain, unique_id).is_some() {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        self.index_entry(entry.clone());
        self.save().await?;

        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );
        Ok(entry)
    }

    /// Add the entries declared in `hub.yaml` that do not exist yet
    pub async fn import_entries(&self, configs: &[EntryConfig]) -> ConfigEntriesResult<usize> {
        let mut added = 0;
        for config in configs {
            let title = config.title.clone().unwrap_or_else(|| config.domain.clone());
            let exists = match &config.unique_id {
                Some(unique_id) => self.get_by_unique_id(&config.domain, unique_id).is_some(),
                None => self
                    .get_by_domain(&config.domain)
                    .iter()
                    .any(|e| e.source == ConfigEntrySource::Import && e.title == title),
            };
            if exists {
                debug!(domain = %config.domain, "Imported entry already exists");
                continue;
            }

            let mut entry = ConfigEntry::new(&config.domain, title)
                .with_data(config.data.clone())
                .with_options(config.options.clone())
                .with_source(ConfigEntrySource::Import);
            if let Some(unique_id) = &config.unique_id {
                entry = entry.with_unique_id(unique_id);
            }
            self.add(entry).await?;
            added += 1;
        }
        Ok(added)
    }

    /// Update persisted fields; a loaded entry whose integration asks for it
    /// is reloaded
    #[instrument(skip(self, update), fields(entry_id = %entry_id))]
    pub async fn update(
        &self,
        entry_id: &str,
        update: ConfigEntryUpdate,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let current = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        let mut updated = current.clone();
        if !update.clone().apply(&mut updated) {
            return Ok(current);
        }

        if updated.unique_id != current.unique_id {
            if let Some(unique_id) = &updated.unique_id {
                if self.get_by_unique_id(&updated.domain, unique_id).is_some() {
                    return Err(ConfigEntriesError::AlreadyExists {
                        domain: updated.domain.clone(),
                        unique_id: unique_id.clone(),
                    });
                }
                self.inner.by_unique_id.insert(
                    (updated.domain.clone(), unique_id.clone()),
                    entry_id.to_string(),
                );
            }
            if let Some(old) = &current.unique_id {
                self.inner
                    .by_unique_id
                    .remove(&(current.domain.clone(), old.clone()));
            }
        }

        let updated = {
            let mut entry = self
                .inner
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
            update.apply(&mut entry);
            entry.clone()
        };
        self.save().await?;
        if let Some(runtime) = self.runtime(entry_id) {
            runtime.refresh_entry(updated.clone());
        }
        debug!("Updated config entry");

        let reload = updated.is_loaded()
            && self
                .inner
                .integrations
                .get(&updated.domain)
                .is_some_and(|i| i.integration().reload_on_update());
        if reload {
            info!("Reloading {} after update", updated.title);
            self.reload(entry_id).await?;
            return self
                .get(entry_id)
                .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()));
        }
        Ok(updated)
    }

    /// Unload (if needed) and delete an entry together with its registry
    /// entities
    #[instrument(skip(self), fields(entry_id = %entry_id))]
    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        let lock = self.entry_lock(entry_id)?;
        let _guard = lock.lock().await;

        self.cancel_retry(entry_id);
        let state = self
            .state(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        if matches!(
            state,
            ConfigEntryState::Loaded | ConfigEntryState::SetupRetry | ConfigEntryState::SetupError
        ) {
            self.unload_locked(entry_id).await?;
        }

        let hub = &self.inner.hub;
        let removed = hub.entity_registry().clear_config_entry(entry_id);
        for registry_entry in &removed {
            if hub.states().contains(&registry_entry.entity_id) {
                hub.states().remove(&registry_entry.entity_id, Context::new());
            }
        }
        if !removed.is_empty() {
            if let Err(err) = hub.save_registries().await {
                warn!("Failed to save entity registry: {}", err);
            }
        }

        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        self.unindex_entry(&entry);
        self.save().await?;

        info!(
            "Removed config entry: {} ({}) [{}], {} entities",
            entry.title,
            entry.domain,
            entry_id,
            removed.len()
        );
        Ok(entry)
    }

    // ==================== Lifecycle ====================

    fn entry_lock(&self, entry_id: &str) -> ConfigEntriesResult<Arc<Mutex<()>>> {
        self.inner
            .entries
            .get(entry_id)
            .map(|e| Arc::clone(&e.setup_lock))
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))
    }

    /// Move an entry to a new state and announce it on the bus
    fn set_state(
        &self,
        entry_id: &str,
        state: ConfigEntryState,
        reason: Option<String>,
    ) -> ConfigEntriesResult<()> {
        let domain = {
            let mut entry = self
                .inner
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
            entry.try_set_state(state, reason.clone())?;
            entry.domain.clone()
        };
        debug!(entry_id, %state, "Config entry state changed");

        self.inner.hub.bus().fire_typed(
            ConfigEntryStateChangedData {
                entry_id: entry_id.to_string(),
                domain,
                state: state.as_str().to_string(),
                reason,
            },
            Context::new(),
        );
        Ok(())
    }

    /// Set up an entry; true when it ends up loaded
    ///
    /// A "not ready" failure schedules a retry, any other failure leaves
    /// the entry in `SetupError`. Either way whatever the integration had
    /// already started is torn down.
    #[instrument(skip(self), fields(entry_id = %entry_id))]
    pub async fn setup(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let lock = self.entry_lock(entry_id)?;
        let _guard = lock.lock().await;
        self.setup_locked(entry_id).await
    }

    async fn setup_locked(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if entry.is_disabled() {
            debug!("Skipping setup of disabled entry");
            return Ok(false);
        }
        if entry.state == ConfigEntryState::Loaded {
            debug!("Entry already loaded");
            return Ok(true);
        }
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            debug!("Not setting up entry while shutting down");
            return Ok(false);
        }

        let Some(integration) = self.inner.integrations.get(&entry.domain) else {
            self.set_state(entry_id, ConfigEntryState::SetupInProgress, None)?;
            let reason = format!("integration {} not found", entry.domain);
            self.set_state(entry_id, ConfigEntryState::SetupError, Some(reason))?;
            error!("Cannot set up {}: integration not found", entry.title);
            return Err(ConfigEntriesError::UnknownIntegration(entry.domain));
        };

        self.cancel_retry(entry_id);
        self.set_state(entry_id, ConfigEntryState::SetupInProgress, None)?;

        let entry = match self.migrate(&integration, entry).await {
            Ok(entry) => entry,
            Err(reason) => {
                error!("Migration of entry failed: {}", reason);
                self.set_state(entry_id, ConfigEntryState::MigrationError, Some(reason))?;
                return Ok(false);
            }
        };

        let handle = EntryHandle::new(
            Arc::clone(&self.inner.hub),
            Arc::clone(&integration),
            entry.clone(),
            self.reauth_trigger(entry_id),
        );
        let setup = integration.integration().setup_entry(&handle);
        let result = match AssertUnwindSafe(setup).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(ConfigEntryError::failed("setup panicked")),
        };

        let err = match result {
            Ok(()) => {
                self.inner.runtimes.insert(entry_id.to_string(), handle);
                if let Some(mut entry) = self.inner.entries.get_mut(entry_id) {
                    entry.reauth_required = false;
                }
                self.set_state(entry_id, ConfigEntryState::Loaded, None)?;
                info!("Set up {} ({})", entry.title, entry.domain);
                return Ok(true);
            }
            Err(err) => err,
        };

        handle.teardown().await;
        match err {
            ConfigEntryError::NotReady(reason) => {
                let setup_config = &self.inner.hub.config().setup;
                let delay = retry_delay(
                    entry.tries,
                    setup_config.retry_base_delay(),
                    setup_config.retry_max_exponent,
                );
                self.set_state(entry_id, ConfigEntryState::SetupRetry, Some(reason.clone()))?;
                if let Some(mut entry) = self.inner.entries.get_mut(entry_id) {
                    entry.increment_tries();
                }
                warn!(
                    "Config entry '{}' for {} not ready yet: {}; retrying in {:.1}s",
                    entry.title,
                    entry.domain,
                    reason,
                    delay.as_secs_f64()
                );
                if !self.inner.shutting_down.load(Ordering::SeqCst) {
                    self.schedule_retry(entry_id, delay);
                }
            }
            ConfigEntryError::AuthFailed(reason) => {
                error!(
                    "Config entry '{}' for {} could not authenticate: {}",
                    entry.title, entry.domain, reason
                );
                self.set_state(entry_id, ConfigEntryState::SetupError, Some(reason.clone()))?;
                self.start_reauth(entry_id, &reason);
            }
            ConfigEntryError::Failed(reason) => {
                error!(
                    "Error setting up entry {} for {}: {}",
                    entry.title, entry.domain, reason
                );
                self.set_state(entry_id, ConfigEntryState::SetupError, Some(reason))?;
            }
        }
        Ok(false)
    }

    /// Bring the entry to the integration's version; Err carries the reason
    async fn migrate(
        &self,
        integration: &LoadedIntegration,
        entry: ConfigEntry,
    ) -> Result<ConfigEntry, String> {
        let target = integration.integration().version();
        if entry.version == target {
            return Ok(entry);
        }
        if entry.version > target {
            return Err(format!(
                "entry version {} is newer than integration version {}",
                entry.version, target
            ));
        }

        let from = entry.version;
        let mut migrated = entry;
        match integration.integration().migrate_entry(&mut migrated).await {
            Ok(()) if migrated.version == target => {}
            Ok(()) => return Err(format!("migration stopped at version {}", migrated.version)),
            Err(err) => return Err(err.to_string()),
        }

        if let Some(mut stored) = self.inner.entries.get_mut(&migrated.entry_id) {
            stored.version = migrated.version;
            stored.minor_version = migrated.minor_version;
            stored.data = migrated.data.clone();
            stored.options = migrated.options.clone();
            stored.modified_at = Utc::now();
        }
        if let Err(err) = self.save().await {
            warn!("Failed to save migrated entry: {}", err);
        }
        info!("Migrated entry from version {} to {}", from, target);
        Ok(migrated)
    }

    fn schedule_retry(&self, entry_id: &str, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let id = entry_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = ConfigEntries::from_weak(&weak) else {
                return;
            };
            manager.inner.retries.remove(&id);
            if manager.inner.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            if let Err(err) = manager.setup(&id).await {
                warn!(entry_id = %id, "Scheduled setup retry failed: {}", err);
            }
        });
        if let Some(previous) = self.inner.retries.insert(entry_id.to_string(), task) {
            previous.abort();
        }
    }

    fn cancel_retry(&self, entry_id: &str) {
        if let Some((_, task)) = self.inner.retries.remove(entry_id) {
            task.abort();
            debug!(entry_id, "Cancelled pending setup retry");
        }
    }

    fn reauth_trigger(&self, entry_id: &str) -> ReauthTrigger {
        let weak = Arc::downgrade(&self.inner);
        let id = entry_id.to_string();
        Arc::new(move |reason: &str| {
            if let Some(manager) = ConfigEntries::from_weak(&weak) {
                manager.start_reauth(&id, reason);
            }
        })
    }

    /// Flag the entry for re-authentication and announce it once
    pub fn start_reauth(&self, entry_id: &str, reason: &str) {
        let data = {
            let Some(mut entry) = self.inner.entries.get_mut(entry_id) else {
                return;
            };
            if entry.reauth_required {
                return;
            }
            entry.reauth_required = true;
            ConfigEntryReauthData {
                entry_id: entry_id.to_string(),
                domain: entry.domain.clone(),
                title: entry.title.clone(),
                reason: reason.to_string(),
            }
        };
        warn!(
            "Config entry '{}' for {} needs re-authentication: {}",
            data.title, data.domain, reason
        );
        self.inner.hub.bus().fire_typed(data, Context::new());
    }

    /// Unload an entry
    ///
    /// Ok(true) when fully unloaded. If some platforms refuse, the entry
    /// stays loaded and [`ConfigEntriesError::UnloadFailed`] is returned;
    /// the unload can be tried again. If the integration's unload errors
    /// the entry ends in `FailedUnload` and Ok(false) is returned.
    #[instrument(skip(self), fields(entry_id = %entry_id))]
    pub async fn unload(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let lock = self.entry_lock(entry_id)?;
        let _guard = lock.lock().await;
        self.unload_locked(entry_id).await
    }

    async fn unload_locked(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        match entry.state {
            ConfigEntryState::NotLoaded => return Ok(true),
            ConfigEntryState::SetupRetry | ConfigEntryState::SetupError => {
                self.cancel_retry(entry_id);
                self.set_state(entry_id, ConfigEntryState::UnloadInProgress, None)?;
                self.set_state(entry_id, ConfigEntryState::NotLoaded, None)?;
                return Ok(true);
            }
            ConfigEntryState::Loaded => {}
            other => return Err(ConfigEntriesError::CannotUnload(other)),
        }

        self.set_state(entry_id, ConfigEntryState::UnloadInProgress, None)?;
        let Some(handle) = self.runtime(entry_id) else {
            self.set_state(entry_id, ConfigEntryState::NotLoaded, None)?;
            return Ok(true);
        };

        let unload = handle.integration().integration().unload_entry(&handle);
        let result = match AssertUnwindSafe(unload).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(ConfigEntryError::failed("unload panicked")),
        };

        match result {
            Ok(true) => {
                handle.teardown().await;
                self.inner.runtimes.remove(entry_id);
                self.set_state(entry_id, ConfigEntryState::NotLoaded, None)?;
                info!("Unloaded {} ({})", entry.title, entry.domain);
                Ok(true)
            }
            Ok(false) => {
                self.set_state(entry_id, ConfigEntryState::Loaded, None)?;
                let still_loaded: Vec<_> = handle
                    .loaded_platforms()
                    .iter()
                    .map(|d| d.as_str())
                    .collect();
                warn!(
                    "Unload of {} incomplete, still loaded: {:?}",
                    entry.title, still_loaded
                );
                Err(ConfigEntriesError::UnloadFailed {
                    entry_id: entry_id.to_string(),
                    reason: format!("platforms still loaded: {}", still_loaded.join(", ")),
                })
            }
            Err(err) => {
                error!("Error unloading entry {} for {}: {}", entry.title, entry.domain, err);
                handle.teardown().await;
                self.inner.runtimes.remove(entry_id);
                self.set_state(
                    entry_id,
                    ConfigEntryState::FailedUnload,
                    Some(err.to_string()),
                )?;
                Ok(false)
            }
        }
    }

    /// Unload and set up again; resets the retry schedule
    #[instrument(skip(self), fields(entry_id = %entry_id))]
    pub async fn reload(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let lock = self.entry_lock(entry_id)?;
        let _guard = lock.lock().await;

        self.cancel_retry(entry_id);
        if let Some(mut entry) = self.inner.entries.get_mut(entry_id) {
            entry.tries = 0;
        }
        if !self.unload_locked(entry_id).await? {
            return Ok(false);
        }
        self.setup_locked(entry_id).await
    }

    /// Disable or enable an entry, unloading or setting it up accordingly
    #[instrument(skip(self), fields(entry_id = %entry_id))]
    pub async fn set_disabled_by(
        &self,
        entry_id: &str,
        disabled_by: Option<ConfigEntryDisabledBy>,
    ) -> ConfigEntriesResult<bool> {
        let lock = self.entry_lock(entry_id)?;
        let _guard = lock.lock().await;

        let current = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        if current.disabled_by == disabled_by {
            return Ok(current.is_loaded());
        }

        if disabled_by.is_some() {
            self.cancel_retry(entry_id);
            if !self.unload_locked(entry_id).await? {
                return Ok(false);
            }
        }
        if let Some(mut entry) = self.inner.entries.get_mut(entry_id) {
            entry.disabled_by = disabled_by;
            entry.modified_at = Utc::now();
        }
        self.save().await?;

        match disabled_by {
            Some(_) => Ok(false),
            None => self.setup_locked(entry_id).await,
        }
    }

    /// Set up every enabled entry that is not loaded, concurrently
    pub async fn setup_all(&self) -> Vec<(String, ConfigEntriesResult<bool>)> {
        let ids: Vec<_> = self
            .inner
            .entries
            .iter()
            .filter(|e| e.state == ConfigEntryState::NotLoaded && !e.is_disabled())
            .map(|e| e.key().clone())
            .collect();
        info!("Setting up {} config entries", ids.len());

        join_all(ids.into_iter().map(|id| async move {
            let result = self.setup(&id).await;
            (id, result)
        }))
        .await
    }

    /// Cancel pending retries and unload every loaded entry
    ///
    /// Waits for setups already running, then unloads what they loaded; no
    /// setup starts after this is called.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let pending: Vec<String> = self.inner.retries.iter().map(|r| r.key().clone()).collect();
        for entry_id in &pending {
            self.cancel_retry(entry_id);
        }

        let ids = self.entry_ids();
        let results = join_all(ids.iter().map(|id| self.unload_on_shutdown(id))).await;
        let mut unloaded = 0;
        for (entry_id, result) in ids.iter().zip(results) {
            match result {
                Ok(Some(true)) => unloaded += 1,
                Ok(Some(false)) => {
                    warn!(entry_id = %entry_id, "Entry failed to unload on shutdown")
                }
                Ok(None) => {}
                Err(err) => warn!(entry_id = %entry_id, "Error unloading on shutdown: {}", err),
            }
        }
        info!("Config entries shut down ({} unloaded)", unloaded);
    }

    /// Unload under the entry lock if loaded; `None` when there was nothing
    /// to unload
    async fn unload_on_shutdown(&self, entry_id: &str) -> ConfigEntriesResult<Option<bool>> {
        let lock = self.entry_lock(entry_id)?;
        let _guard = lock.lock().await;
        if self.state(entry_id) != Some(ConfigEntryState::Loaded) {
            return Ok(None);
        }
        self.unload_locked(entry_id).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::Integration;
    use async_trait::async_trait;
    use hub_config::HubConfig;
    use hub_core::EventBus;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Integration whose setup results are scripted per call
    #[derive(Default)]
    struct Scripted {
        version: u32,
        outcomes: StdMutex<VecDeque<Result<(), ConfigEntryError>>>,
        migrate_to: Option<u32>,
    }

    impl Scripted {
        fn with_outcomes(outcomes: Vec<Result<(), ConfigEntryError>>) -> Self {
            Self {
                version: 1,
                outcomes: StdMutex::new(outcomes.into()),
                migrate_to: None,
            }
        }
    }

    #[async_trait]
    impl Integration for Scripted {
        fn domain(&self) -> &str {
            "hue"
        }

        fn version(&self) -> u32 {
            self.version
        }

        async fn migrate_entry(&self, entry: &mut ConfigEntry) -> Result<(), ConfigEntryError> {
            match self.migrate_to {
                Some(version) => {
                    entry.version = version;
                    entry.data.insert("migrated".into(), serde_json::json!(true));
                    Ok(())
                }
                None => Err(ConfigEntryError::failed("cannot migrate")),
            }
        }

        async fn setup_entry(&self, _entry: &EntryHandle) -> Result<(), ConfigEntryError> {
            self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn create_test_manager(integration: Option<Scripted>) -> (TempDir, ConfigEntries) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = HubConfig::default();
        config.config_dir = temp_dir.path().to_path_buf();
        let hub = HubContext::new(config);
        let integrations = Arc::new(IntegrationRegistry::new());
        if let Some(integration) = integration {
            integrations.register(Arc::new(integration));
        }
        (temp_dir, ConfigEntries::new(hub, integrations))
    }

    #[tokio::test]
    async fn test_add_entry() {
        let (_dir, manager) = create_test_manager(None);

        let entry = ConfigEntry::new("hue", "Philips Hue")
            .with_unique_id("bridge-001")
            .with_source(ConfigEntrySource::Discovery);

        let added = manager.add(entry).await.unwrap();
        assert_eq!(added.domain, "hue");
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.domains(), vec!["hue".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_unique_id_rejected() {
        let (_dir, manager) = create_test_manager(None);

        manager
            .add(ConfigEntry::new("hue", "Bridge 1").with_unique_id("same-id"))
            .await
            .unwrap();
        let result = manager
            .add(ConfigEntry::new("hue", "Bridge 2").with_unique_id("same-id"))
            .await;

        assert!(matches!(
            result,
            Err(ConfigEntriesError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_by_domain() {
        let (_dir, manager) = create_test_manager(None);

        manager.add(ConfigEntry::new("hue", "Hue 1")).await.unwrap();
        manager.add(ConfigEntry::new("hue", "Hue 2")).await.unwrap();
        manager.add(ConfigEntry::new("mqtt", "MQTT")).await.unwrap();

        assert_eq!(manager.get_by_domain("hue").len(), 2);
        assert_eq!(manager.get_by_domain("mqtt").len(), 1);
        assert!(manager.get_loaded_by_domain("hue").is_empty());
    }

    #[tokio::test]
    async fn test_update_entry() {
        let (_dir, manager) = create_test_manager(None);

        let entry = manager
            .add(ConfigEntry::new("hue", "Old Name").with_unique_id("a"))
            .await
            .unwrap();

        let updated = manager
            .update(
                &entry.entry_id,
                ConfigEntryUpdate::new()
                    .title("New Name")
                    .unique_id(Some("b".into())),
            )
            .await
            .unwrap();

        assert_eq!(updated.title, "New Name");
        assert!(manager.get_by_unique_id("hue", "a").is_none());
        assert_eq!(
            manager.get_by_unique_id("hue", "b").unwrap().entry_id,
            entry.entry_id
        );
    }

    #[tokio::test]
    async fn test_remove_entry() {
        let (_dir, manager) = create_test_manager(None);

        let entry = manager.add(ConfigEntry::new("hue", "Test")).await.unwrap();
        manager.remove(&entry.entry_id).await.unwrap();
        assert_eq!(manager.len(), 0);
        assert!(matches!(
            manager.remove(&entry.entry_id).await,
            Err(ConfigEntriesError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_setup_and_unload() {
        let (_dir, manager) = create_test_manager(Some(Scripted::with_outcomes(vec![])));
        let bus: Arc<EventBus> = Arc::clone(manager.hub().bus());
        let mut events = bus.subscribe_typed::<ConfigEntryStateChangedData>();

        let entry = manager.add(ConfigEntry::new("hue", "Test")).await.unwrap();
        assert!(manager.setup(&entry.entry_id).await.unwrap());
        assert_eq!(manager.state(&entry.entry_id), Some(ConfigEntryState::Loaded));
        assert!(manager.runtime(&entry.entry_id).is_some());

        assert!(manager.unload(&entry.entry_id).await.unwrap());
        assert_eq!(
            manager.state(&entry.entry_id),
            Some(ConfigEntryState::NotLoaded)
        );
        assert!(manager.runtime(&entry.entry_id).is_none());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.data.state);
        }
        assert_eq!(
            seen,
            vec![
                "setup_in_progress",
                "loaded",
                "unload_in_progress",
                "not_loaded"
            ]
        );
    }

    #[tokio::test]
    async fn test_setup_failure() {
        let (_dir, manager) = create_test_manager(Some(Scripted::with_outcomes(vec![Err(
            ConfigEntryError::failed("Connection failed"),
        )])));

        let entry = manager.add(ConfigEntry::new("hue", "Test")).await.unwrap();
        assert!(!manager.setup(&entry.entry_id).await.unwrap());

        let entry = manager.get(&entry.entry_id).unwrap();
        assert_eq!(entry.state, ConfigEntryState::SetupError);
        assert_eq!(entry.reason.as_deref(), Some("Connection failed"));
        assert!(!manager.has_pending_retry(&entry.entry_id));

        // A manual setup from SetupError is allowed
        assert!(manager.setup(&entry.entry_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_integration() {
        let (_dir, manager) = create_test_manager(None);
        let entry = manager.add(ConfigEntry::new("hue", "Test")).await.unwrap();

        let result = manager.setup(&entry.entry_id).await;
        assert!(matches!(result, Err(ConfigEntriesError::UnknownIntegration(d)) if d == "hue"));
        assert_eq!(
            manager.state(&entry.entry_id),
            Some(ConfigEntryState::SetupError)
        );
    }

    #[tokio::test]
    async fn test_disabled_entry_skipped() {
        let (_dir, manager) = create_test_manager(Some(Scripted::with_outcomes(vec![])));
        let entry = manager
            .add(ConfigEntry::new("hue", "Test").with_disabled_by(ConfigEntryDisabledBy::User))
            .await
            .unwrap();

        assert!(!manager.setup(&entry.entry_id).await.unwrap());
        assert_eq!(
            manager.state(&entry.entry_id),
            Some(ConfigEntryState::NotLoaded)
        );

        assert!(manager
            .set_disabled_by(&entry.entry_id, None)
            .await
            .unwrap());
        assert!(manager.get(&entry.entry_id).unwrap().is_loaded());

        assert!(!manager
            .set_disabled_by(&entry.entry_id, Some(ConfigEntryDisabledBy::User))
            .await
            .unwrap());
        assert_eq!(
            manager.state(&entry.entry_id),
            Some(ConfigEntryState::NotLoaded)
        );
    }

    #[tokio::test]
    async fn test_newer_entry_version_is_migration_error() {
        let (_dir, manager) = create_test_manager(Some(Scripted::with_outcomes(vec![])));
        let entry = manager
            .add(ConfigEntry::new("hue", "Test").with_version(3, 1))
            .await
            .unwrap();

        assert!(!manager.setup(&entry.entry_id).await.unwrap());
        assert_eq!(
            manager.state(&entry.entry_id),
            Some(ConfigEntryState::MigrationError)
        );
        assert!(matches!(
            manager.setup(&entry.entry_id).await,
            Err(ConfigEntriesError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_older_entry_is_migrated() {
        let integration = Scripted {
            version: 2,
            migrate_to: Some(2),
            ..Default::default()
        };
        let (_dir, manager) = create_test_manager(Some(integration));
        let entry = manager
            .add(ConfigEntry::new("hue", "Test").with_version(1, 1))
            .await
            .unwrap();

        assert!(manager.setup(&entry.entry_id).await.unwrap());
        let entry = manager.get(&entry.entry_id).unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(entry.data_value::<bool>("migrated"), Some(true));
    }

    #[tokio::test]
    async fn test_failed_migration() {
        let integration = Scripted {
            version: 2,
            ..Default::default()
        };
        let (_dir, manager) = create_test_manager(Some(integration));
        let entry = manager.add(ConfigEntry::new("hue", "Test")).await.unwrap();

        assert!(!manager.setup(&entry.entry_id).await.unwrap());
        let entry = manager.get(&entry.entry_id).unwrap();
        assert_eq!(entry.state, ConfigEntryState::MigrationError);
        assert_eq!(entry.reason.as_deref(), Some("cannot migrate"));
        assert!(matches!(
            manager.unload(&entry.entry_id).await,
            Err(ConfigEntriesError::CannotUnload(ConfigEntryState::MigrationError))
        ));
    }

    #[tokio::test]
    async fn test_auth_failure_requests_reauth() {
        let (_dir, manager) = create_test_manager(Some(Scripted::with_outcomes(vec![Err(
            ConfigEntryError::auth_failed("bad token"),
        )])));
        let mut reauth = manager
            .hub()
            .bus()
            .subscribe_typed::<ConfigEntryReauthData>();

        let entry = manager.add(ConfigEntry::new("hue", "Test")).await.unwrap();
        assert!(!manager.setup(&entry.entry_id).await.unwrap());

        let stored = manager.get(&entry.entry_id).unwrap();
        assert_eq!(stored.state, ConfigEntryState::SetupError);
        assert!(stored.reauth_required);
        assert!(!manager.has_pending_retry(&entry.entry_id));

        let event = reauth.try_recv().unwrap();
        assert_eq!(event.data.entry_id, entry.entry_id);
        assert_eq!(event.data.reason, "bad token");
    }

    #[tokio::test]
    async fn test_import_entries_once() {
        let (_dir, manager) = create_test_manager(None);
        let configs: Vec<EntryConfig> = serde_json::from_value(serde_json::json!([
            {"domain": "hue", "title": "Bridge", "unique_id": "bridge-1", "data": {"host": "10.0.0.2"}},
            {"domain": "mqtt", "title": "Broker"}
        ]))
        .unwrap();

        assert_eq!(manager.import_entries(&configs).await.unwrap(), 2);
        assert_eq!(manager.import_entries(&configs).await.unwrap(), 0);

        let bridge = manager.get_by_unique_id("hue", "bridge-1").unwrap();
        assert_eq!(bridge.source, ConfigEntrySource::Import);
        assert_eq!(bridge.data_value::<String>("host").as_deref(), Some("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = HubConfig::default();
        config.config_dir = temp_dir.path().to_path_buf();

        {
            let manager = ConfigEntries::new(
                HubContext::new(config.clone()),
                Arc::new(IntegrationRegistry::new()),
            );
            manager
                .add(
                    ConfigEntry::new("hue", "Test")
                        .with_unique_id("test-123")
                        .with_source(ConfigEntrySource::Import),
                )
                .await
                .unwrap();
        }

        let manager = ConfigEntries::new(
            HubContext::new(config),
            Arc::new(IntegrationRegistry::new()),
        );
        manager.load().await.unwrap();

        assert_eq!(manager.len(), 1);
        let entry = manager.get_by_unique_id("hue", "test-123").unwrap();
        assert_eq!(entry.title, "Test");
        assert_eq!(entry.source, ConfigEntrySource::Import);
        assert_eq!(entry.state, ConfigEntryState::NotLoaded);
    }
}
