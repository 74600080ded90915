//! Errors raised while loading `hub.yaml`

use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `!secret` names a key missing from `secrets.yaml`
    #[error("unknown secret {key:?}")]
    SecretNotFound { key: String },

    /// `!env_var` without fallback names an unset variable
    #[error("environment variable {var} is not set")]
    EnvVarNotFound { var: String },

    #[error("{key}: {reason}")]
    InvalidValue { key: String, reason: String },

    /// An imported entry under `entries:` is malformed
    #[error("entries[{index}]: {reason}")]
    InvalidEntry { index: usize, reason: String },
}
