//! Core types for the hub
//!
//! This crate provides the fundamental types shared by every other crate:
//! [`EntityId`], [`State`], [`Event`], [`Context`], the [`EventBus`] and the
//! [`PlatformDomain`] key used to dispatch entity platforms.

mod bus;
mod context;
mod domains;
mod entity_id;
mod event;
mod state;

pub use bus::{EventBus, SharedEventBus, TypedEventReceiver};
pub use context::Context;
pub use domains::{PlatformDomain, UnknownPlatformDomain};
pub use entity_id::{slugify, EntityId, EntityIdError};
pub use event::{Event, EventData, EventType};
pub use state::State;

/// Maximum length for a state value
pub const MAX_STATE_LENGTH: usize = 255;

/// Rendered state of an entity with no value yet
pub const STATE_UNKNOWN: &str = "unknown";

/// Rendered state of an entity whose data source is failing
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// Standard event types fired by the hub
pub mod events {
    use super::*;

    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Event type for config entry lifecycle transitions
    pub const CONFIG_ENTRY_STATE_CHANGED: &str = "config_entry_state_changed";

    /// Event type fired when an entry needs new credentials
    pub const CONFIG_ENTRY_REAUTH: &str = "config_entry_reauth";

    /// Event type for hub start
    pub const HUB_START: &str = "hub_start";

    /// Event type for hub stop
    pub const HUB_STOP: &str = "hub_stop";

    /// Data for STATE_CHANGED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }

    /// Data for CONFIG_ENTRY_STATE_CHANGED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct ConfigEntryStateChangedData {
        pub entry_id: String,
        pub domain: String,
        /// Snake-case name of the new lifecycle state
        pub state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub reason: Option<String>,
    }

    impl EventData for ConfigEntryStateChangedData {
        fn event_type() -> &'static str {
            CONFIG_ENTRY_STATE_CHANGED
        }
    }

    /// Data for CONFIG_ENTRY_REAUTH events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct ConfigEntryReauthData {
        pub entry_id: String,
        pub domain: String,
        pub title: String,
        pub reason: String,
    }

    impl EventData for ConfigEntryReauthData {
        fn event_type() -> &'static str {
            CONFIG_ENTRY_REAUTH
        }
    }
}
