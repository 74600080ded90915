//! Index of live entities and command dispatch
//!
//! Every entity added by any platform is registered here under its entity
//! id. Commands look the entity up, check the capability, run it and write
//! the resulting state.

use crate::entity::Entity;
use crate::error::{EntityError, EntityResult};
use crate::handle::EntityHandle;
use dashmap::DashMap;
use hub_core::EntityId;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Clone)]
struct LiveEntity {
    entity: Arc<dyn Entity>,
    handle: EntityHandle,
}

#[derive(Default)]
pub struct EntityComponent {
    entities: DashMap<EntityId, LiveEntity>,
}

impl EntityComponent {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, entity: Arc<dyn Entity>, handle: EntityHandle) {
        debug!(entity_id = %handle.entity_id(), "Entity registered");
        self.entities
            .insert(handle.entity_id().clone(), LiveEntity { entity, handle });
    }

    pub(crate) fn unregister(&self, entity_id: &EntityId) -> bool {
        self.entities.remove(entity_id).is_some()
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<Arc<dyn Entity>> {
        self.entities.get(entity_id).map(|e| Arc::clone(&e.entity))
    }

    pub fn handle(&self, entity_id: &EntityId) -> Option<EntityHandle> {
        self.entities.get(entity_id).map(|e| e.handle.clone())
    }

    pub fn contains(&self, entity_id: &EntityId) -> bool {
        self.entities.contains_key(entity_id)
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<_> = self.entities.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn live(&self, entity_id: &EntityId) -> EntityResult<LiveEntity> {
        self.entities
            .get(entity_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EntityError::NotFound(entity_id.to_string()))
    }

    #[instrument(skip(self), fields(entity_id = %entity_id))]
    pub async fn turn_on(&self, entity_id: &EntityId) -> EntityResult<()> {
        let live = self.live(entity_id)?;
        toggle_capability(&live, entity_id)?.turn_on().await?;
        live.handle.write_state();
        Ok(())
    }

    #[instrument(skip(self), fields(entity_id = %entity_id))]
    pub async fn turn_off(&self, entity_id: &EntityId) -> EntityResult<()> {
        let live = self.live(entity_id)?;
        toggle_capability(&live, entity_id)?.turn_off().await?;
        live.handle.write_state();
        Ok(())
    }

    #[instrument(skip(self), fields(entity_id = %entity_id))]
    pub async fn toggle(&self, entity_id: &EntityId) -> EntityResult<()> {
        let live = self.live(entity_id)?;
        toggle_capability(&live, entity_id)?.toggle().await?;
        live.handle.write_state();
        Ok(())
    }

    #[instrument(skip(self), fields(entity_id = %entity_id))]
    pub async fn set_value(&self, entity_id: &EntityId, value: f64) -> EntityResult<()> {
        let live = self.live(entity_id)?;
        let number = live.entity.as_number().ok_or_else(|| EntityError::Unsupported {
            entity_id: entity_id.to_string(),
            capability: "set_value",
        })?;
        let (min, max) = (number.min_value(), number.max_value());
        if !(min..=max).contains(&value) {
            return Err(EntityError::OutOfRange { value, min, max });
        }
        number.set_value(value).await?;
        live.handle.write_state();
        Ok(())
    }

    /// Run the entity's own update and write the result
    #[instrument(skip(self), fields(entity_id = %entity_id))]
    pub async fn request_update(&self, entity_id: &EntityId) -> EntityResult<()> {
        let live = self.live(entity_id)?;
        live.entity.update().await?;
        live.handle.write_state();
        Ok(())
    }
}

fn toggle_capability<'a>(
    live: &'a LiveEntity,
    entity_id: &EntityId,
) -> EntityResult<&'a dyn crate::entity::ToggleEntity> {
    live.entity.as_toggle().ok_or_else(|| EntityError::Unsupported {
        entity_id: entity_id.to_string(),
        capability: "on/off",
    })
}
