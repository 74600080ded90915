//! Hub configuration
//!
//! Loads `hub.yaml` into a [`HubConfig`]. Values can reference
//! `secrets.yaml` with `!secret key` and the environment with
//! `!env_var VAR [fallback]`.
//!
//! ```ignore
//! let config = hub_config::HubConfig::load("/etc/hub/hub.yaml")?;
//! let settings = config.coordinator.settings();
//! ```

mod config;
mod error;
mod loader;

pub use config::{
    CoordinatorConfig, EntryConfig, ExecutorConfig, HubConfig, LoggerConfig, SetupConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, load_yaml_str, Secrets};
