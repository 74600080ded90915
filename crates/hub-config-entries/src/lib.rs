//! Config entries
//!
//! Config entries are the persisted, user-configured instances of
//! integrations. This crate turns them into running coordinators and
//! entities and reverses that exactly on unload.
//!
//! # Key Types
//!
//! - [`ConfigEntry`] / [`ConfigEntryState`]: the record and its lifecycle
//! - [`Integration`] / [`Platform`]: what an integration implements
//! - [`ConfigEntries`]: setup, retry, unload, reload and persistence
//! - [`EntryHandle`]: what an integration receives during setup
//! - [`HubContext`]: shared hub services, passed explicitly
//!
//! # Storage
//!
//! Entries are persisted in `.storage/core.config_entries`.

mod context;
mod entry;
mod error;
mod integration;
mod manager;
mod runtime;
mod state_machine;

pub use context::{ExecutorError, HubContext};
pub use entry::{
    ConfigEntry, ConfigEntryDisabledBy, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate,
};
pub use error::{ConfigEntriesError, ConfigEntriesResult, ConfigEntryError};
pub use integration::{Integration, IntegrationRegistry, LoadedIntegration, Platform};
pub use manager::{
    ConfigEntries, ConfigEntriesData, STORAGE_KEY, STORAGE_MINOR_VERSION, STORAGE_VERSION,
};
pub use runtime::{EntryHandle, ManagedCoordinator};
pub use state_machine::{retry_delay, InvalidTransition};
