//! Error types for config entries

use crate::entry::ConfigEntryState;
use crate::state_machine::InvalidTransition;
use hub_coordinator::UpdateError;
use thiserror::Error;

/// Outcome of an integration's setup, as reported by the integration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigEntryError {
    /// Try again later; the entry goes to `SetupRetry`
    #[error("not ready: {0}")]
    NotReady(String),

    /// Credentials are invalid; the user must re-authenticate
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Anything else; the entry goes to `SetupError`
    #[error("{0}")]
    Failed(String),
}

impl ConfigEntryError {
    pub fn not_ready(reason: impl Into<String>) -> Self {
        ConfigEntryError::NotReady(reason.into())
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        ConfigEntryError::AuthFailed(reason.into())
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        ConfigEntryError::Failed(reason.into())
    }

    pub fn reason(&self) -> &str {
        match self {
            ConfigEntryError::NotReady(reason)
            | ConfigEntryError::AuthFailed(reason)
            | ConfigEntryError::Failed(reason) => reason,
        }
    }
}

/// A failed first refresh means the device is not ready yet, unless the
/// credentials were rejected
impl From<UpdateError> for ConfigEntryError {
    fn from(err: UpdateError) -> Self {
        match err {
            UpdateError::AuthFailed(reason) => ConfigEntryError::AuthFailed(reason),
            other => ConfigEntryError::NotReady(other.to_string()),
        }
    }
}

/// Errors from the config entries manager
#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("no integration registered for domain {0}")]
    UnknownIntegration(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("cannot unload entry in state {0}")]
    CannotUnload(ConfigEntryState),

    /// Some platforms did not unload; the entry stays loaded and the
    /// unload can be tried again
    #[error("unload of entry {entry_id} incomplete: {reason}")]
    UnloadFailed { entry_id: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] hub_registries::StorageError),
}

impl ConfigEntriesError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConfigEntriesError::UnloadFailed { .. })
    }
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;
