//! Per-platform entity registrar
//!
//! One [`EntityPlatform`] exists per (integration, platform domain, config
//! entry). Platform setup code receives an [`AddEntities`] and calls it as
//! often as it discovers devices. Each entity gets an entity id (persisted in
//! the entity registry when it has a unique id) before it goes live.

use crate::component::EntityComponent;
use crate::entity::Entity;
use crate::error::{EntityError, EntityResult};
use crate::handle::EntityHandle;
use crate::state_store::SharedStateStore;
use hub_core::{Context, EntityId, PlatformDomain};
use hub_registries::{DisabledBy, EntityEntry, EntityRegistry, RegistryRequest};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Where a platform lives and how it treats new entities
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    pub domain: PlatformDomain,
    /// Integration providing the entities
    pub platform: String,
    pub config_entry_id: Option<String>,
    /// Create new registry entries disabled by the integration
    pub pref_disable_new_entities: bool,
}

/// Services a platform publishes entities into
#[derive(Clone)]
pub struct EntityServices {
    pub states: SharedStateStore,
    pub registry: Arc<EntityRegistry>,
    pub component: Arc<EntityComponent>,
}

struct PlatformEntity {
    entity: Arc<dyn Entity>,
    handle: EntityHandle,
}

pub struct EntityPlatform {
    info: PlatformInfo,
    services: EntityServices,
    entities: Mutex<IndexMap<EntityId, PlatformEntity>>,
    /// Serializes add_entities calls so id allocation stays consistent
    add_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<JoinSet<()>>,
}

impl EntityPlatform {
    pub fn new(info: PlatformInfo, services: EntityServices) -> Arc<Self> {
        Arc::new(Self {
            info,
            services,
            entities: Mutex::new(IndexMap::new()),
            add_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    pub fn info(&self) -> &PlatformInfo {
        &self.info
    }

    pub fn domain(&self) -> PlatformDomain {
        self.info.domain
    }

    fn lock_entities(&self) -> MutexGuard<'_, IndexMap<EntityId, PlatformEntity>> {
        self.entities.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Entity ids currently live on this platform, in add order
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.lock_entities().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_entities().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Callback handed to platform setup code
    pub fn add_entities_callback(self: &Arc<Self>) -> AddEntities {
        AddEntities {
            platform: Arc::clone(self),
        }
    }

    /// Publish entities; returns how many went live
    ///
    /// An entity whose unique id is already live on the hub replaces the
    /// live one. Entities whose registry entry is disabled are skipped, as
    /// are entities whose `update_before_add` update fails.
    #[instrument(skip(self, entities), fields(platform = %self.info.platform, domain = %self.info.domain))]
    pub async fn add_entities(
        &self,
        entities: Vec<Arc<dyn Entity>>,
        update_before_add: bool,
    ) -> usize {
        let _guard = self.add_lock.lock().await;
        let mut added = 0;
        let mut registry_changed = false;

        for entity in entities {
            if update_before_add {
                if let Err(err) = entity.update().await {
                    error!(
                        "Error adding entity {} for platform {}: update failed: {}",
                        entity.name().unwrap_or_default(),
                        self.info.platform,
                        err
                    );
                    continue;
                }
            }

            let (entity_id, registry_entry, created) = self.allocate_entity_id(entity.as_ref());
            registry_changed |= created;

            if registry_entry.as_ref().is_some_and(|e| e.is_disabled()) {
                debug!(entity_id = %entity_id, "Not adding disabled entity");
                continue;
            }

            if self.services.component.contains(&entity_id) {
                debug!(entity_id = %entity_id, "Replacing existing entity with the same unique id");
                self.retire(&entity_id, false).await;
            }

            let handle = EntityHandle::new(
                entity_id.clone(),
                self.info.platform.clone(),
                self.info.config_entry_id.clone(),
                registry_entry,
                &entity,
                Arc::clone(&self.services.states),
            );
            entity.added_to_hub(handle.clone()).await;

            self.services
                .component
                .register(Arc::clone(&entity), handle.clone());
            self.lock_entities().insert(
                entity_id.clone(),
                PlatformEntity {
                    entity,
                    handle: handle.clone(),
                },
            );
            handle.write_state();
            added += 1;
        }

        if registry_changed {
            if let Err(err) = self.services.registry.save().await {
                warn!("Failed to save entity registry: {}", err);
            }
        }
        debug!(added, "Entities added");
        added
    }

    /// Pick the entity id for an entity, registering it when it has a
    /// unique id; the flag reports a newly created registry entry
    fn allocate_entity_id(
        &self,
        entity: &dyn Entity,
    ) -> (EntityId, Option<Arc<EntityEntry>>, bool) {
        let component = &self.services.component;
        let states = &self.services.states;
        let registry = &self.services.registry;
        let name = entity.name();

        let Some(unique_id) = entity.unique_id() else {
            let suggested = EntityId::for_platform(
                self.info.domain,
                name.as_deref().unwrap_or(&self.info.platform),
            );
            let entity_id = registry
                .generate_entity_id(&suggested, |id| component.contains(id) || states.contains(id));
            return (entity_id, None, false);
        };

        let existed = registry
            .get_entity_id(self.info.domain, &self.info.platform, &unique_id)
            .is_some();
        let description = entity.description();
        let request = RegistryRequest {
            domain: self.info.domain,
            platform: self.info.platform.clone(),
            suggested_object_id: name
                .clone()
                .unwrap_or_else(|| format!("{} {}", self.info.platform, unique_id)),
            unique_id,
            config_entry_id: self.info.config_entry_id.clone(),
            original_name: name,
            original_device_class: description.and_then(|d| d.device_class.clone()),
            original_icon: description.and_then(|d| d.icon.clone()),
            unit_of_measurement: description.and_then(|d| d.unit_of_measurement.clone()),
            disabled_by: self
                .info
                .pref_disable_new_entities
                .then_some(DisabledBy::Integration),
        };
        // Ids held by live entities without a registry entry are taken
        let entry = registry.get_or_create(request, |id| {
            component.contains(id) && !registry.is_registered(id)
        });
        (entry.entity_id.clone(), Some(entry), !existed)
    }

    /// Schedule an add from synchronous code; tracked until the platform
    /// is reset
    pub fn spawn_add(self: &Arc<Self>, entities: Vec<Arc<dyn Entity>>, update_before_add: bool) {
        let platform = Arc::clone(self);
        self.lock_tasks().spawn(async move {
            platform.add_entities(entities, update_before_add).await;
        });
    }

    /// Take one entity off the hub
    async fn retire(&self, entity_id: &EntityId, remove_state: bool) {
        let removed = self.lock_entities().shift_remove(entity_id);
        let live = match removed {
            Some(PlatformEntity { entity, handle }) => Some((entity, handle)),
            None => self
                .services
                .component
                .get(entity_id)
                .zip(self.services.component.handle(entity_id)),
        };
        if let Some((entity, handle)) = live {
            entity.will_remove_from_hub().await;
            handle.mark_removed();
        }
        self.services.component.unregister(entity_id);
        if remove_state {
            self.services.states.remove(entity_id, Context::new());
        }
    }

    /// Remove one entity of this platform from the hub
    pub async fn remove_entity(&self, entity_id: &EntityId) -> EntityResult<()> {
        if !self.lock_entities().contains_key(entity_id) {
            return Err(EntityError::NotFound(entity_id.to_string()));
        }
        self.retire(entity_id, true).await;
        Ok(())
    }

    /// Cancel pending adds and remove every entity of this platform
    pub async fn reset(&self) {
        let mut pending = std::mem::take(&mut *self.lock_tasks());
        pending.abort_all();
        while pending.join_next().await.is_some() {}

        let _guard = self.add_lock.lock().await;
        let entity_ids = self.entity_ids();
        for entity_id in &entity_ids {
            self.retire(entity_id, true).await;
        }
        info!(
            platform = %self.info.platform,
            domain = %self.info.domain,
            removed = entity_ids.len(),
            "Platform reset"
        );
    }
}

/// The add-entities callback given to platform setup
#[derive(Clone)]
pub struct AddEntities {
    platform: Arc<EntityPlatform>,
}

impl AddEntities {
    pub async fn add(&self, entities: Vec<Arc<dyn Entity>>, update_before_add: bool) -> usize {
        self.platform.add_entities(entities, update_before_add).await
    }

    /// Fire-and-forget variant for code that cannot await
    pub fn spawn(&self, entities: Vec<Arc<dyn Entity>>, update_before_add: bool) {
        self.platform.spawn_add(entities, update_before_add);
    }

    pub fn platform(&self) -> &Arc<EntityPlatform> {
        &self.platform
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator_entity::CoordinatorValueEntity;
    use crate::description::{EntityDescription, ValueDescription};
    use crate::state_store::StateStore;
    use async_trait::async_trait;
    use hub_coordinator::Coordinator;
    use hub_core::EventBus;
    use hub_registries::Storage;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Gauge {
        unique_id: Option<String>,
        description: EntityDescription,
        value: String,
        fail_update: bool,
        updates: AtomicUsize,
        removals: Arc<AtomicUsize>,
    }

    impl Gauge {
        fn new(unique_id: Option<&str>, name: &str, value: &str) -> Self {
            Self {
                unique_id: unique_id.map(str::to_string),
                description: EntityDescription::new(name).name(name),
                value: value.to_string(),
                fail_update: false,
                updates: AtomicUsize::new(0),
                removals: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Entity for Gauge {
        fn unique_id(&self) -> Option<String> {
            self.unique_id.clone()
        }

        fn description(&self) -> Option<&EntityDescription> {
            Some(&self.description)
        }

        fn state(&self) -> Option<String> {
            Some(self.value.clone())
        }

        async fn update(&self) -> EntityResult<()> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if self.fail_update {
                return Err(EntityError::UpdateFailed("device offline".to_string()));
            }
            Ok(())
        }

        async fn will_remove_from_hub(&self) {
            self.removals.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        _dir: TempDir,
        services: EntityServices,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(dir.path()));
        Fixture {
            services: EntityServices {
                states: Arc::new(StateStore::new(Arc::new(EventBus::new()))),
                registry: Arc::new(EntityRegistry::new(storage)),
                component: Arc::new(EntityComponent::new()),
            },
            _dir: dir,
        }
    }

    fn platform(fixture: &Fixture, pref_disable: bool) -> Arc<EntityPlatform> {
        EntityPlatform::new(
            PlatformInfo {
                domain: PlatformDomain::Sensor,
                platform: "demo".to_string(),
                config_entry_id: Some("entry1".to_string()),
                pref_disable_new_entities: pref_disable,
            },
            fixture.services.clone(),
        )
    }

    #[tokio::test]
    async fn test_duplicate_unique_id_replaces() {
        let fixture = fixture();
        let platform = platform(&fixture, false);

        let e1 = Arc::new(Gauge::new(Some("uid1"), "Outdoor", "21"));
        let e1_removals = Arc::clone(&e1.removals);
        let e2 = Arc::new(Gauge::new(Some("uid2"), "Indoor", "19"));
        assert_eq!(platform.add_entities(vec![e1, e2], false).await, 2);

        let e1b = Arc::new(Gauge::new(Some("uid1"), "Outdoor renamed", "22"));
        assert_eq!(platform.add_entities(vec![e1b], false).await, 1);

        let registry = &fixture.services.registry;
        assert_eq!(registry.len(), 2);
        assert_eq!(platform.len(), 2);
        assert_eq!(fixture.services.component.len(), 2);
        assert_eq!(e1_removals.load(Ordering::SeqCst), 1);

        let entity_id = registry
            .get_entity_id(PlatformDomain::Sensor, "demo", "uid1")
            .unwrap();
        assert_eq!(entity_id.to_string(), "sensor.outdoor");
        let state = fixture.services.states.get(&entity_id).unwrap();
        assert_eq!(state.state, "22");
        assert_eq!(state.attributes["friendly_name"], "Outdoor renamed");
        assert_eq!(
            registry.get(&entity_id).unwrap().original_name.as_deref(),
            Some("Outdoor renamed")
        );
    }

    #[tokio::test]
    async fn test_entity_ids_deduplicated() {
        let fixture = fixture();
        let platform = platform(&fixture, false);

        let entities: Vec<Arc<dyn Entity>> = vec![
            Arc::new(Gauge::new(Some("a"), "Temperature", "1")),
            Arc::new(Gauge::new(Some("b"), "Temperature", "2")),
            Arc::new(Gauge::new(None, "Temperature", "3")),
        ];
        platform.add_entities(entities, false).await;

        let ids: Vec<String> = platform.entity_ids().iter().map(|id| id.to_string()).collect();
        assert_eq!(
            ids,
            vec![
                "sensor.temperature",
                "sensor.temperature_2",
                "sensor.temperature_3"
            ]
        );
        assert_eq!(fixture.services.registry.len(), 2);
    }

    #[tokio::test]
    async fn test_update_before_add() {
        let fixture = fixture();
        let platform = platform(&fixture, false);

        let good = Arc::new(Gauge::new(Some("good"), "Good", "1"));
        let mut bad = Gauge::new(Some("bad"), "Bad", "2");
        bad.fail_update = true;
        let bad = Arc::new(bad);

        let added = platform
            .add_entities(vec![good.clone(), bad.clone()], true)
            .await;
        assert_eq!(added, 1);
        assert_eq!(good.updates.load(Ordering::SeqCst), 1);
        assert_eq!(bad.updates.load(Ordering::SeqCst), 1);
        assert_eq!(platform.entity_ids()[0].to_string(), "sensor.good");
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_before_add_fills_coordinator_entity() {
        let fixture = fixture();
        let platform = platform(&fixture, false);

        let coordinator: Coordinator<i32> = Coordinator::builder("thermo", || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(21)
        })
        .build();
        let sensor = CoordinatorValueEntity::new(
            coordinator.clone(),
            "thermo1",
            ValueDescription::new(EntityDescription::new("temp").name("Temp"), |v: &i32| {
                Some(json!(v))
            }),
        );
        assert!(coordinator.data().is_none());

        assert_eq!(platform.add_entities(vec![Arc::new(sensor)], true).await, 1);
        assert_eq!(coordinator.data().as_deref(), Some(&21));
        let state = fixture
            .services
            .states
            .get(&platform.entity_ids()[0])
            .unwrap();
        assert_eq!(state.state, "21");
    }

    #[tokio::test]
    async fn test_pref_disable_new_entities() {
        let fixture = fixture();
        let platform = platform(&fixture, true);

        let added = platform
            .add_entities(vec![Arc::new(Gauge::new(Some("x"), "Hidden", "1"))], false)
            .await;
        assert_eq!(added, 0);
        let entry = fixture.services.registry.iter().pop().unwrap();
        assert_eq!(entry.disabled_by, Some(DisabledBy::Integration));
        assert_eq!(fixture.services.states.entity_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_removes_everything() {
        let fixture = fixture();
        let platform = platform(&fixture, false);
        let gauge = Arc::new(Gauge::new(Some("p"), "Gauge", "1"));
        let removals = Arc::clone(&gauge.removals);

        platform.add_entities(vec![gauge], false).await;
        platform.spawn_add(vec![Arc::new(Gauge::new(Some("q"), "Queued", "2"))], false);
        platform.reset().await;

        assert!(platform.is_empty());
        assert!(fixture.services.component.is_empty());
        assert_eq!(fixture.services.states.entity_count(), 0);
        assert_eq!(removals.load(Ordering::SeqCst), 1);
        // registry entries survive a reset
        assert!(!fixture.services.registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_single_entity() {
        let fixture = fixture();
        let platform = platform(&fixture, false);
        let gauge = Arc::new(Gauge::new(Some("p"), "Gauge", "1"));
        let removals = Arc::clone(&gauge.removals);
        platform
            .add_entities(vec![gauge, Arc::new(Gauge::new(Some("q"), "Other", "2"))], false)
            .await;

        let id: EntityId = "sensor.gauge".parse().unwrap();
        platform.remove_entity(&id).await.unwrap();
        assert_eq!(removals.load(Ordering::SeqCst), 1);
        assert_eq!(platform.len(), 1);
        assert!(!fixture.services.states.contains(&id));
        assert!(matches!(
            platform.remove_entity(&id).await,
            Err(EntityError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_saved_after_new_entries() {
        let fixture = fixture();
        let platform = platform(&fixture, false);
        platform
            .add_entities(vec![Arc::new(Gauge::new(Some("p"), "Gauge", "1"))], false)
            .await;

        let reloaded = EntityRegistry::new(Arc::new(Storage::new(fixture._dir.path())));
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.len(), 1);
    }
}
