//! Error types for coordinator refreshes

use std::time::Duration;
use thiserror::Error;

/// Why a refresh did not produce fresh data
///
/// Cloneable so every caller coalesced onto one refresh observes the same
/// outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    /// Recoverable fetch failure (network blip, device busy, bad payload)
    #[error("update failed: {0}")]
    Failed(String),

    /// The fetch did not finish within the request timeout
    #[error("update timed out after {0:?}")]
    Timeout(Duration),

    /// Credentials were rejected; retrying will not help
    #[error("authentication failed: {0}")]
    AuthFailed(String),
}

impl UpdateError {
    pub fn failed(reason: impl Into<String>) -> Self {
        UpdateError::Failed(reason.into())
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        UpdateError::AuthFailed(reason.into())
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, UpdateError::AuthFailed(_))
    }
}
