//! Hub registries
//!
//! Persistent registries stored as versioned JSON documents under the
//! `.storage/` directory of the hub's config dir.

pub mod entity_registry;
pub mod storage;

pub use entity_registry::{
    DisabledBy, EntityEntry, EntityRegistry, EntityRegistryData, EntityRegistryError,
    RegistryRequest,
};
pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};
