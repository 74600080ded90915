//! Entity trait and optional capabilities
//!
//! Entities are composed rather than layered: the base [`Entity`] trait
//! covers identity, rendering and lifecycle, and command support is exposed
//! through capability accessors ([`Entity::as_toggle`], [`Entity::as_number`]).
//! Coordinator-backed entities embed a
//! [`CoordinatorEntity`](crate::CoordinatorEntity) and delegate to it.

use crate::description::EntityDescription;
use crate::error::EntityResult;
use crate::handle::EntityHandle;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

#[async_trait]
pub trait Entity: Send + Sync + 'static {
    /// Stable id across restarts; entities without one are not persisted
    fn unique_id(&self) -> Option<String> {
        None
    }

    fn description(&self) -> Option<&EntityDescription> {
        None
    }

    fn name(&self) -> Option<String> {
        self.description().and_then(|d| d.name.clone())
    }

    /// Current value; `None` renders as `unknown`
    fn state(&self) -> Option<String>;

    fn attributes(&self) -> HashMap<String, Value> {
        HashMap::new()
    }

    fn available(&self) -> bool {
        true
    }

    /// Fetch fresh data for this entity
    async fn update(&self) -> EntityResult<()> {
        Ok(())
    }

    /// Called once the entity has an id and is about to go live
    async fn added_to_hub(&self, _handle: EntityHandle) {}

    /// Called before the entity is removed; release subscriptions here
    async fn will_remove_from_hub(&self) {}

    /// Invoked synchronously by the coordinator after every update
    fn handle_coordinator_update(&self, handle: &EntityHandle) {
        handle.write_state();
    }

    fn as_toggle(&self) -> Option<&dyn ToggleEntity> {
        None
    }

    fn as_number(&self) -> Option<&dyn NumberEntity> {
        None
    }
}

/// Entities that can be switched on and off
#[async_trait]
pub trait ToggleEntity: Send + Sync {
    fn is_on(&self) -> Option<bool>;

    async fn turn_on(&self) -> EntityResult<()>;

    async fn turn_off(&self) -> EntityResult<()>;

    async fn toggle(&self) -> EntityResult<()> {
        if self.is_on() == Some(true) {
            self.turn_off().await
        } else {
            self.turn_on().await
        }
    }
}

/// Entities holding a settable numeric value
#[async_trait]
pub trait NumberEntity: Send + Sync {
    fn value(&self) -> Option<f64>;

    fn min_value(&self) -> f64 {
        0.0
    }

    fn max_value(&self) -> f64 {
        100.0
    }

    fn step(&self) -> f64 {
        1.0
    }

    async fn set_value(&self, value: f64) -> EntityResult<()>;
}
