//! Config entry records
//!
//! A [`ConfigEntry`] is one configured instance of an integration, e.g. one
//! weather station or one cloud account. The persisted part is the record
//! itself; lifecycle state, retry counters and the setup lock live only in
//! memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::state_machine::InvalidTransition;

/// Lifecycle state of a config entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    #[default]
    NotLoaded,
    SetupInProgress,
    Loaded,
    /// Setup failed and will not be retried automatically
    SetupError,
    /// Setup reported "not ready"; a retry is scheduled
    SetupRetry,
    /// Stored version could not be migrated (terminal)
    MigrationError,
    UnloadInProgress,
    /// The integration's unload raised (terminal)
    FailedUnload,
}

impl ConfigEntryState {
    /// Whether the entry can be unloaded or reloaded from this state
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConfigEntryState::Loaded
                | ConfigEntryState::SetupError
                | ConfigEntryState::SetupRetry
                | ConfigEntryState::NotLoaded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigEntryState::NotLoaded => "not_loaded",
            ConfigEntryState::SetupInProgress => "setup_in_progress",
            ConfigEntryState::Loaded => "loaded",
            ConfigEntryState::SetupError => "setup_error",
            ConfigEntryState::SetupRetry => "setup_retry",
            ConfigEntryState::MigrationError => "migration_error",
            ConfigEntryState::UnloadInProgress => "unload_in_progress",
            ConfigEntryState::FailedUnload => "failed_unload",
        }
    }
}

impl fmt::Display for ConfigEntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the entry came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    #[default]
    User,
    /// Declared in `hub.yaml`
    Import,
    Discovery,
    Reauth,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryDisabledBy {
    User,
}

/// A configuration entry for an integration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Unique identifier (ULID)
    pub entry_id: String,

    /// Integration domain (e.g. "demo")
    pub domain: String,

    pub title: String,

    /// Connection parameters
    #[serde(default)]
    pub data: HashMap<String, Value>,

    /// User-tunable options
    #[serde(default)]
    pub options: HashMap<String, Value>,

    /// Schema version, compared against the integration's on setup
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_version")]
    pub minor_version: u32,

    /// Prevents two entries for the same device or account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    #[serde(default)]
    pub source: ConfigEntrySource,

    /// Create new registry entries disabled
    #[serde(default)]
    pub pref_disable_new_entities: bool,

    /// Do not run coordinator timers for this entry
    #[serde(default)]
    pub pref_disable_polling: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<ConfigEntryDisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,

    #[serde(skip, default)]
    pub state: ConfigEntryState,

    /// Why the entry is in a failed or retry state
    #[serde(skip, default)]
    pub reason: Option<String>,

    /// Credentials were rejected; the user has to re-authenticate
    #[serde(skip, default)]
    pub reauth_required: bool,

    /// Setup attempts since the last success or reload
    #[serde(skip, default)]
    pub tries: u32,

    /// Serializes setup, unload and reload of this entry
    #[serde(skip)]
    pub setup_lock: Arc<Mutex<()>>,
}

fn default_version() -> u32 {
    1
}

impl ConfigEntry {
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: HashMap::new(),
            options: HashMap::new(),
            version: 1,
            minor_version: 1,
            unique_id: None,
            source: ConfigEntrySource::User,
            pref_disable_new_entities: false,
            pref_disable_polling: false,
            disabled_by: None,
            created_at: now,
            modified_at: now,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            reauth_required: false,
            tries: 0,
            setup_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_data(mut self, data: HashMap<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_options(mut self, options: HashMap<String, Value>) -> Self {
        self.options = options;
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_source(mut self, source: ConfigEntrySource) -> Self {
        self.source = source;
        self
    }

    pub fn with_version(mut self, version: u32, minor_version: u32) -> Self {
        self.version = version;
        self.minor_version = minor_version;
        self
    }

    pub fn with_disabled_by(mut self, disabled_by: ConfigEntryDisabledBy) -> Self {
        self.disabled_by = Some(disabled_by);
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ConfigEntryState::Loaded
    }

    /// Typed read of a `data` field
    pub fn data_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Typed read of an `options` field, falling back to `data`
    pub fn option_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.options
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .or_else(|| self.data_value(key))
    }

    /// Move to `new_state` if the state machine allows it
    ///
    /// The retry counter survives only transitions that belong to a retry
    /// cycle.
    pub fn try_set_state(
        &mut self,
        new_state: ConfigEntryState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.state = self.state.try_transition(new_state)?;
        self.reason = reason;
        if !matches!(
            new_state,
            ConfigEntryState::SetupRetry | ConfigEntryState::SetupInProgress
        ) {
            self.tries = 0;
        }
        Ok(())
    }

    pub fn increment_tries(&mut self) {
        self.tries = self.tries.saturating_add(1);
    }
}

/// Partial update of an entry's persisted fields
#[derive(Debug, Clone, Default)]
pub struct ConfigEntryUpdate {
    pub title: Option<String>,
    pub data: Option<HashMap<String, Value>>,
    pub options: Option<HashMap<String, Value>>,
    pub unique_id: Option<Option<String>>,
    pub version: Option<u32>,
    pub minor_version: Option<u32>,
    pub pref_disable_new_entities: Option<bool>,
    pub pref_disable_polling: Option<bool>,
}

impl ConfigEntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn data(mut self, data: HashMap<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn options(mut self, options: HashMap<String, Value>) -> Self {
        self.options = Some(options);
        self
    }

    pub fn unique_id(mut self, unique_id: Option<String>) -> Self {
        self.unique_id = Some(unique_id);
        self
    }

    pub fn version(mut self, version: u32, minor_version: u32) -> Self {
        self.version = Some(version);
        self.minor_version = Some(minor_version);
        self
    }

    pub fn pref_disable_new_entities(mut self, value: bool) -> Self {
        self.pref_disable_new_entities = Some(value);
        self
    }

    pub fn pref_disable_polling(mut self, value: bool) -> Self {
        self.pref_disable_polling = Some(value);
        self
    }

    /// Apply to `entry`; returns whether anything changed
    pub fn apply(self, entry: &mut ConfigEntry) -> bool {
        let mut changed = false;
        if let Some(title) = self.title {
            changed |= entry.title != title;
            entry.title = title;
        }
        if let Some(data) = self.data {
            changed |= entry.data != data;
            entry.data = data;
        }
        if let Some(options) = self.options {
            changed |= entry.options != options;
            entry.options = options;
        }
        if let Some(unique_id) = self.unique_id {
            changed |= entry.unique_id != unique_id;
            entry.unique_id = unique_id;
        }
        if let Some(version) = self.version {
            changed |= entry.version != version;
            entry.version = version;
        }
        if let Some(minor_version) = self.minor_version {
            changed |= entry.minor_version != minor_version;
            entry.minor_version = minor_version;
        }
        if let Some(pref) = self.pref_disable_new_entities {
            changed |= entry.pref_disable_new_entities != pref;
            entry.pref_disable_new_entities = pref;
        }
        if let Some(pref) = self.pref_disable_polling {
            changed |= entry.pref_disable_polling != pref;
            entry.pref_disable_polling = pref;
        }
        if changed {
            entry.modified_at = Utc::now();
        }
        changed
    }
}
