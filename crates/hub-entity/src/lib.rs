//! Entities for the hub
//!
//! - [`Entity`] and its capabilities ([`ToggleEntity`], [`NumberEntity`])
//! - [`EntityDescription`] / [`ValueDescription`] metadata
//! - [`CoordinatorEntity`], the coordinator binding embedded in entities
//! - [`StateStore`], the current rendered state of every entity
//! - [`EntityPlatform`], the add-entities registrar, and [`EntityComponent`],
//!   the index of live entities used for command dispatch

mod component;
mod coordinator_entity;
mod description;
mod entity;
mod error;
mod handle;
mod platform;
mod state_store;

pub use component::EntityComponent;
pub use coordinator_entity::{CoordinatorEntity, CoordinatorValueEntity};
pub use description::{render_value, EntityCategory, EntityDescription, ValueDescription};
pub use entity::{Entity, NumberEntity, ToggleEntity};
pub use error::{EntityError, EntityResult};
pub use handle::{
    render_state, EntityHandle, ATTR_DEVICE_CLASS, ATTR_FRIENDLY_NAME, ATTR_ICON,
    ATTR_UNIT_OF_MEASUREMENT,
};
pub use platform::{AddEntities, EntityPlatform, EntityServices, PlatformInfo};
pub use state_store::{SharedStateStore, StateStore};
