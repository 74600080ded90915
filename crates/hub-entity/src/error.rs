//! Error types for entities and entity platforms

use hub_coordinator::UpdateError;
use hub_core::EntityIdError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EntityError {
    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("{entity_id} does not support {capability}")]
    Unsupported {
        entity_id: String,
        capability: &'static str,
    },

    #[error("invalid entity id: {0}")]
    InvalidEntityId(#[from] EntityIdError),

    #[error("value {value} outside of [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("update failed: {0}")]
    UpdateFailed(String),
}

impl From<UpdateError> for EntityError {
    fn from(err: UpdateError) -> Self {
        EntityError::UpdateFailed(err.to_string())
    }
}

pub type EntityResult<T> = Result<T, EntityError>;
