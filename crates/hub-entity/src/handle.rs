//! Handle given to a live entity
//!
//! The handle knows where the entity's state goes (entity id, state store,
//! registry entry) and holds only a weak reference back to the entity, so a
//! coordinator listener capturing the handle never keeps an entity alive.

use crate::entity::Entity;
use crate::state_store::SharedStateStore;
use hub_core::{Context, EntityId, State, STATE_UNAVAILABLE, STATE_UNKNOWN};
use hub_registries::EntityEntry;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;

pub const ATTR_FRIENDLY_NAME: &str = "friendly_name";
pub const ATTR_UNIT_OF_MEASUREMENT: &str = "unit_of_measurement";
pub const ATTR_DEVICE_CLASS: &str = "device_class";
pub const ATTR_ICON: &str = "icon";

struct HandleInner {
    entity_id: EntityId,
    platform: String,
    config_entry_id: Option<String>,
    registry_entry: Option<Arc<EntityEntry>>,
    entity: Weak<dyn Entity>,
    states: SharedStateStore,
    /// Context for the next write, consumed by it
    context: Mutex<Option<Context>>,
    removed: AtomicBool,
}

#[derive(Clone)]
pub struct EntityHandle {
    inner: Arc<HandleInner>,
}

impl EntityHandle {
    pub(crate) fn new(
        entity_id: EntityId,
        platform: impl Into<String>,
        config_entry_id: Option<String>,
        registry_entry: Option<Arc<EntityEntry>>,
        entity: &Arc<dyn Entity>,
        states: SharedStateStore,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                entity_id,
                platform: platform.into(),
                config_entry_id,
                registry_entry,
                entity: Arc::downgrade(entity),
                states,
                context: Mutex::new(None),
                removed: AtomicBool::new(false),
            }),
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.inner.entity_id
    }

    /// Integration that provides the entity
    pub fn platform(&self) -> &str {
        &self.inner.platform
    }

    pub fn config_entry_id(&self) -> Option<&str> {
        self.inner.config_entry_id.as_deref()
    }

    pub fn registry_entry(&self) -> Option<&Arc<EntityEntry>> {
        self.inner.registry_entry.as_ref()
    }

    pub fn entity(&self) -> Option<Arc<dyn Entity>> {
        self.inner.entity.upgrade()
    }

    /// Attribute the next state write to `context`
    pub fn set_context(&self, context: Context) {
        *self.inner.context.lock().unwrap_or_else(|p| p.into_inner()) = Some(context);
    }

    /// Coordinator listener entry point
    ///
    /// Writes made by the entity in response carry a child of `cause`, the
    /// context of the coordinator update being delivered.
    pub fn coordinator_updated(&self, cause: Option<&Context>) {
        if self.is_removed() {
            return;
        }
        let Some(entity) = self.entity() else {
            return;
        };
        if let Some(cause) = cause {
            self.set_context(cause.child());
        }
        entity.handle_coordinator_update(self);
        self.inner
            .context
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
    }

    /// Render the entity and write it to the state store
    ///
    /// No-op once the entity has been removed.
    pub fn write_state(&self) -> Option<State> {
        if self.is_removed() {
            trace!(entity_id = %self.inner.entity_id, "Ignoring write for removed entity");
            return None;
        }
        let entity = self.entity()?;
        let (state, attributes) =
            render_state(entity.as_ref(), self.inner.registry_entry.as_deref());
        let context = self
            .inner
            .context
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .unwrap_or_default();

        Some(
            self.inner
                .states
                .set(self.inner.entity_id.clone(), state, attributes, context),
        )
    }

    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_removed(&self) {
        self.inner.removed.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityHandle")
            .field("entity_id", &self.inner.entity_id)
            .field("platform", &self.inner.platform)
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// Compute the state string and attributes written for an entity
///
/// Unavailable entities render as `unavailable` and keep only display
/// metadata; a missing value renders as `unknown`. A name set on the
/// registry entry overrides the entity's own name.
pub fn render_state(
    entity: &dyn Entity,
    registry_entry: Option<&EntityEntry>,
) -> (String, HashMap<String, Value>) {
    let available = entity.available();
    let state = if !available {
        STATE_UNAVAILABLE.to_string()
    } else {
        entity.state().unwrap_or_else(|| STATE_UNKNOWN.to_string())
    };

    let mut attributes = if available {
        entity.attributes()
    } else {
        HashMap::new()
    };

    let friendly_name = registry_entry
        .and_then(|entry| entry.name.clone())
        .or_else(|| entity.name());
    if let Some(name) = friendly_name {
        attributes.insert(ATTR_FRIENDLY_NAME.to_string(), Value::String(name));
    }
    if let Some(description) = entity.description() {
        let metadata = [
            (ATTR_UNIT_OF_MEASUREMENT, &description.unit_of_measurement),
            (ATTR_DEVICE_CLASS, &description.device_class),
            (ATTR_ICON, &description.icon),
        ];
        for (key, value) in metadata {
            if let Some(value) = value {
                attributes.insert(key.to_string(), Value::String(value.clone()));
            }
        }
    }

    (state, attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::EntityDescription;
    use crate::state_store::StateStore;
    use async_trait::async_trait;
    use hub_core::EventBus;
    use serde_json::json;

    struct Gauge {
        description: EntityDescription,
        value: Mutex<Option<String>>,
        available: AtomicBool,
    }

    #[async_trait]
    impl Entity for Gauge {
        fn description(&self) -> Option<&EntityDescription> {
            Some(&self.description)
        }

        fn state(&self) -> Option<String> {
            self.value.lock().unwrap().clone()
        }

        fn attributes(&self) -> HashMap<String, Value> {
            HashMap::from([("battery".to_string(), json!(88))])
        }

        fn available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }
    }

    fn setup() -> (Arc<Gauge>, EntityHandle, SharedStateStore) {
        let states = Arc::new(StateStore::new(Arc::new(EventBus::new())));
        let gauge = Arc::new(Gauge {
            description: EntityDescription::new("pressure")
                .name("Pressure")
                .unit("hPa")
                .device_class("pressure"),
            value: Mutex::new(None),
            available: AtomicBool::new(true),
        });
        let entity: Arc<dyn Entity> = gauge.clone();
        let handle = EntityHandle::new(
            "sensor.pressure".parse().unwrap(),
            "demo",
            None,
            None,
            &entity,
            Arc::clone(&states),
        );
        (gauge, handle, states)
    }

    #[test]
    fn test_renders_unknown_value_and_unavailable() {
        let (gauge, handle, _states) = setup();

        let state = handle.write_state().unwrap();
        assert_eq!(state.state, STATE_UNKNOWN);
        assert_eq!(state.attributes[ATTR_FRIENDLY_NAME], "Pressure");
        assert_eq!(state.attributes[ATTR_UNIT_OF_MEASUREMENT], "hPa");
        assert_eq!(state.attributes["battery"], 88);

        *gauge.value.lock().unwrap() = Some("1013".to_string());
        assert_eq!(handle.write_state().unwrap().state, "1013");

        gauge.available.store(false, Ordering::SeqCst);
        let state = handle.write_state().unwrap();
        assert_eq!(state.state, STATE_UNAVAILABLE);
        assert!(!state.attributes.contains_key("battery"));
        assert_eq!(state.attributes[ATTR_DEVICE_CLASS], "pressure");
    }

    #[test]
    fn test_removed_handle_does_not_write() {
        let (_gauge, handle, states) = setup();
        handle.mark_removed();

        assert!(handle.write_state().is_none());
        handle.coordinator_updated(None);
        assert_eq!(states.entity_count(), 0);
    }

    #[test]
    fn test_context_applies_to_next_write_only() {
        let (_gauge, handle, _states) = setup();
        let context = Context::with_user("admin");
        handle.set_context(context.clone());

        assert_eq!(handle.write_state().unwrap().context, context);
        assert_ne!(handle.write_state().unwrap().context, context);
    }

    #[test]
    fn test_coordinator_update_writes_child_context() {
        let (_gauge, handle, states) = setup();
        let cause = Context::new();

        handle.coordinator_updated(Some(&cause));
        let state = states.get(handle.entity_id()).unwrap();
        assert!(cause.is_parent_of(&state.context));

        // not carried over to an unrelated later write
        assert!(!cause.is_parent_of(&handle.write_state().unwrap().context));
    }

    #[test]
    fn test_dropped_entity_is_not_resurrected() {
        let (gauge, handle, _states) = setup();
        drop(gauge);
        assert!(handle.entity().is_none());
        assert!(handle.write_state().is_none());
    }
}
