//! Entity Registry
//!
//! Persists the mapping from an integration-supplied unique id to the entity
//! id the hub assigned to it, so entity ids are stable across restarts.
//! Entities without a unique id are never registered.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hub_core::{EntityId, PlatformDomain};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageResult};

/// Storage key for entity registry
pub const STORAGE_KEY: &str = "core.entity_registry";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Errors that can occur in the entity registry
#[derive(Debug, Error, Clone)]
pub enum EntityRegistryError {
    #[error("Entity not found: {0}")]
    NotFound(String),
}

/// Reason an entity was disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledBy {
    ConfigEntry,
    Integration,
    User,
}

/// A registered entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    /// Internal registry id (lowercase ULID)
    pub id: String,
    pub entity_id: EntityId,
    /// Integration-supplied identifier, unique per (domain, platform)
    pub unique_id: String,
    /// Integration domain that provides this entity
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_entry_id: Option<String>,

    /// User-set name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name supplied by the integration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_device_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<DisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl EntityEntry {
    pub fn domain(&self) -> &str {
        self.entity_id.domain()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    fn key(&self) -> (String, String, String) {
        (
            self.domain().to_string(),
            self.platform.clone(),
            self.unique_id.clone(),
        )
    }
}

/// What a platform knows about an entity it wants registered
#[derive(Debug, Clone)]
pub struct RegistryRequest {
    pub domain: PlatformDomain,
    pub platform: String,
    pub unique_id: String,
    /// Used for the object id when the entity is new
    pub suggested_object_id: String,
    pub config_entry_id: Option<String>,
    pub original_name: Option<String>,
    pub original_device_class: Option<String>,
    pub original_icon: Option<String>,
    pub unit_of_measurement: Option<String>,
    /// Applied only when the entry is created
    pub disabled_by: Option<DisabledBy>,
}

/// Entity registry data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRegistryData {
    pub entities: Vec<EntityEntry>,
}

impl Storable for EntityRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Entity Registry with lookups by entity id, unique id and config entry
///
/// Entries are handed out as `Arc<EntityEntry>`; updates replace the Arc.
pub struct EntityRegistry {
    storage: Arc<Storage>,

    /// Primary index, insertion ordered
    by_entity_id: RwLock<IndexMap<EntityId, Arc<EntityEntry>>>,

    /// Index: (domain, platform, unique_id) -> entity_id
    by_unique_id: DashMap<(String, String, String), EntityId>,

    /// Index: config_entry_id -> entity_ids
    by_config_entry_id: DashMap<String, HashSet<EntityId>>,

    /// Serializes get_or_create so two callers cannot claim the same id
    create_lock: Mutex<()>,
}

impl EntityRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_entity_id: RwLock::new(IndexMap::new()),
            by_unique_id: DashMap::new(),
            by_config_entry_id: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    /// Load from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(data) = self.storage.load_document::<EntityRegistryData>().await? {
            info!("Loading {} entities from storage", data.entities.len());
            for entry in data.entities {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    /// Save to storage
    pub async fn save(&self) -> StorageResult<()> {
        let data = EntityRegistryData {
            entities: self.iter().iter().map(|e| (**e).clone()).collect(),
        };
        self.storage.save_document(&data).await?;
        debug!("Saved {} entities to storage", data.entities.len());
        Ok(())
    }

    fn index_entry(&self, entry: Arc<EntityEntry>) {
        self.by_unique_id
            .insert(entry.key(), entry.entity_id.clone());

        if let Some(ref config_entry_id) = entry.config_entry_id {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(entry.entity_id.clone());
        }

        if let Ok(mut idx) = self.by_entity_id.write() {
            idx.insert(entry.entity_id.clone(), entry);
        }
    }

    fn unindex_entry(&self, entry: &EntityEntry) {
        self.by_unique_id.remove(&entry.key());

        if let Some(ref config_entry_id) = entry.config_entry_id {
            if let Some(mut ids) = self.by_config_entry_id.get_mut(config_entry_id) {
                ids.remove(&entry.entity_id);
            }
        }

        if let Ok(mut idx) = self.by_entity_id.write() {
            idx.shift_remove(&entry.entity_id);
        }
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .ok()
            .and_then(|idx| idx.get(entity_id).cloned())
    }

    /// Look up the entity id assigned to a unique id
    pub fn get_entity_id(
        &self,
        domain: PlatformDomain,
        platform: &str,
        unique_id: &str,
    ) -> Option<EntityId> {
        let key = (
            domain.as_str().to_string(),
            platform.to_string(),
            unique_id.to_string(),
        );
        self.by_unique_id.get(&key).map(|id| id.clone())
    }

    /// All entities created for a config entry
    pub fn get_by_config_entry_id(&self, config_entry_id: &str) -> Vec<Arc<EntityEntry>> {
        self.by_config_entry_id
            .get(config_entry_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn is_registered(&self, entity_id: &EntityId) -> bool {
        self.by_entity_id
            .read()
            .map(|idx| idx.contains_key(entity_id))
            .unwrap_or(false)
    }

    /// Return the existing entry for this unique id, or register a new one
    ///
    /// `is_reserved` reports entity ids that are taken outside the registry
    /// (e.g. live entities without a unique id). An existing entry has its
    /// integration-supplied metadata refreshed from the request.
    pub fn get_or_create(
        &self,
        request: RegistryRequest,
        is_reserved: impl Fn(&EntityId) -> bool,
    ) -> Arc<EntityEntry> {
        let _guard = self.create_lock.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(entity_id) =
            self.get_entity_id(request.domain, &request.platform, &request.unique_id)
        {
            let refreshed = self.update(&entity_id, |entry| {
                entry.config_entry_id = request.config_entry_id.clone();
                entry.original_name = request.original_name.clone();
                entry.original_device_class = request.original_device_class.clone();
                entry.original_icon = request.original_icon.clone();
                entry.unit_of_measurement = request.unit_of_measurement.clone();
            });
            if let Ok(entry) = refreshed {
                debug!("Found existing entity by unique_id: {}", entry.entity_id);
                return entry;
            }
        }

        let suggested = EntityId::for_platform(request.domain, &request.suggested_object_id);
        let entity_id = self.generate_entity_id(&suggested, is_reserved);

        let now = Utc::now();
        let entry = Arc::new(EntityEntry {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            entity_id: entity_id.clone(),
            unique_id: request.unique_id,
            platform: request.platform,
            config_entry_id: request.config_entry_id,
            name: None,
            original_name: request.original_name,
            original_device_class: request.original_device_class,
            original_icon: request.original_icon,
            unit_of_measurement: request.unit_of_measurement,
            disabled_by: request.disabled_by,
            created_at: now,
            modified_at: now,
        });
        self.index_entry(Arc::clone(&entry));

        info!("Registered new entity: {}", entity_id);
        entry
    }

    /// Pick a free entity id, appending `_2`, `_3`, ... on collision
    pub fn generate_entity_id(
        &self,
        suggested: &EntityId,
        is_reserved: impl Fn(&EntityId) -> bool,
    ) -> EntityId {
        let available = |id: &EntityId| !self.is_registered(id) && !is_reserved(id);

        if available(suggested) {
            return suggested.clone();
        }
        (2..)
            .map(|n| suggested.with_suffix(n))
            .find(|id| available(id))
            .unwrap_or_else(|| suggested.clone())
    }

    /// Apply a change to an entry and re-index it
    pub fn update<F>(
        &self,
        entity_id: &EntityId,
        f: F,
    ) -> Result<Arc<EntityEntry>, EntityRegistryError>
    where
        F: FnOnce(&mut EntityEntry),
    {
        let current = self
            .get(entity_id)
            .ok_or_else(|| EntityRegistryError::NotFound(entity_id.to_string()))?;

        self.unindex_entry(&current);
        let mut entry = (*current).clone();
        f(&mut entry);
        entry.modified_at = Utc::now();

        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        Ok(entry)
    }

    pub fn remove(&self, entity_id: &EntityId) -> Option<Arc<EntityEntry>> {
        let entry = self.get(entity_id)?;
        self.unindex_entry(&entry);
        info!("Removed entity: {}", entity_id);
        Some(entry)
    }

    /// Remove every entity that belongs to a config entry
    pub fn clear_config_entry(&self, config_entry_id: &str) -> Vec<Arc<EntityEntry>> {
        let removed: Vec<_> = self
            .get_by_config_entry_id(config_entry_id)
            .into_iter()
            .filter_map(|entry| self.remove(&entry.entity_id))
            .collect();
        self.by_config_entry_id.remove(config_entry_id);
        removed
    }

    pub fn len(&self) -> usize {
        self.by_entity_id.read().map(|idx| idx.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries in registration order
    pub fn iter(&self) -> Vec<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .map(|idx| idx.values().cloned().collect())
            .unwrap_or_default()
    }
}
