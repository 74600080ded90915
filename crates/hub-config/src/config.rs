//! Hub configuration (`hub.yaml`)
//!
//! Every section is optional and falls back to its defaults.

use crate::error::{ConfigError, ConfigResult};
use crate::loader::load_yaml;
use hub_coordinator::CoordinatorSettings;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Directory holding `.storage/`; relative paths resolve against the
    /// directory of the config file
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    #[serde(default)]
    pub logger: LoggerConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub setup: SetupConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Entries imported from YAML
    #[serde(default)]
    pub entries: Vec<EntryConfig>,
}

fn default_config_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            logger: LoggerConfig::default(),
            coordinator: CoordinatorConfig::default(),
            setup: SetupConfig::default(),
            executor: ExecutorConfig::default(),
            entries: Vec::new(),
        }
    }
}

/// Log levels, in `tracing` filter syntax
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-target overrides, e.g. `hub_coordinator: debug`
    #[serde(default)]
    pub logs: BTreeMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            logs: BTreeMap::new(),
        }
    }
}

impl LoggerConfig {
    /// Filter directives such as `info,hub_coordinator=debug`
    pub fn directives(&self) -> String {
        std::iter::once(self.default.clone())
            .chain(
                self.logs
                    .iter()
                    .map(|(target, level)| format!("{}={}", target, level)),
            )
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Defaults applied to every coordinator, all durations in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_cooldown")]
    pub request_refresh_cooldown: u64,
    #[serde(default = "default_true")]
    pub request_refresh_immediate: bool,
    #[serde(default = "default_max_backoff")]
    pub max_backoff: u64,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_cooldown() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_max_backoff() -> u64 {
    300
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            request_refresh_cooldown: default_cooldown(),
            request_refresh_immediate: true,
            max_backoff: default_max_backoff(),
        }
    }
}

impl CoordinatorConfig {
    pub fn settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            request_timeout: Duration::from_secs(self.request_timeout),
            cooldown: Duration::from_secs(self.request_refresh_cooldown),
            immediate: self.request_refresh_immediate,
            max_backoff: Duration::from_secs(self.max_backoff),
        }
    }
}

/// Setup retry schedule: `base * 2^min(tries, max_exponent)` plus jitter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay: u64,
    #[serde(default = "default_retry_max_exponent")]
    pub retry_max_exponent: u32,
}

fn default_retry_base_delay() -> u64 {
    5
}

fn default_retry_max_exponent() -> u32 {
    4
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            retry_base_delay: default_retry_base_delay(),
            retry_max_exponent: default_retry_max_exponent(),
        }
    }
}

impl SetupConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Upper bound on concurrently running blocking jobs
    #[serde(default = "default_max_blocking_workers")]
    pub max_blocking_workers: usize,
}

fn default_max_blocking_workers() -> usize {
    8
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_blocking_workers: default_max_blocking_workers(),
        }
    }
}

/// A config entry declared in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    pub domain: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub data: HashMap<String, JsonValue>,
    #[serde(default)]
    pub options: HashMap<String, JsonValue>,
}

impl HubConfig {
    /// Load, resolve and validate a config file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let value = load_yaml(path)?;
        let mut config: HubConfig = if value.is_null() {
            HubConfig::default()
        } else {
            serde_yaml::from_value(value).map_err(|source| ConfigError::ParseYaml {
                path: path.to_path_buf(),
                source,
            })?
        };

        if config.config_dir.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            config.config_dir = base.join(&config.config_dir);
        }
        config.validate()?;

        info!(
            "Loaded configuration from {:?} ({} YAML entries)",
            path,
            config.entries.len()
        );
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: HubConfig =
            serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
                path: PathBuf::from("<string>"),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let positive = [
            ("coordinator.request_timeout", self.coordinator.request_timeout),
            ("coordinator.max_backoff", self.coordinator.max_backoff),
            ("setup.retry_base_delay", self.setup.retry_base_delay),
            (
                "executor.max_blocking_workers",
                self.executor.max_blocking_workers as u64,
            ),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if let Some(index) = self.entries.iter().position(|e| e.domain.trim().is_empty()) {
            return Err(ConfigError::InvalidEntry {
                index,
                reason: "domain must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = HubConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.logger.default, "info");
        assert_eq!(config.coordinator.request_timeout, 30);
        assert!(config.coordinator.request_refresh_immediate);
        assert_eq!(config.setup.retry_max_exponent, 4);
        assert_eq!(config.executor.max_blocking_workers, 8);
        assert!(config.entries.is_empty());
    }

    #[test]
    fn test_full_document() {
        let config = HubConfig::from_yaml_str(
            r#"
logger:
  default: warn
  logs:
    hub_coordinator: debug
coordinator:
  request_timeout: 12
  request_refresh_immediate: false
setup:
  retry_base_delay: 2
entries:
  - domain: demo
    title: Garden
    unique_id: garden-1
    data:
      station: garden
      interval: 15
"#,
        )
        .unwrap();

        assert_eq!(config.logger.directives(), "warn,hub_coordinator=debug");
        let settings = config.coordinator.settings();
        assert_eq!(settings.request_timeout, Duration::from_secs(12));
        assert!(!settings.immediate);
        assert_eq!(settings.max_backoff, Duration::from_secs(300));
        assert_eq!(config.setup.retry_base_delay(), Duration::from_secs(2));

        let entry = &config.entries[0];
        assert_eq!(entry.unique_id.as_deref(), Some("garden-1"));
        assert_eq!(entry.data["interval"], serde_json::json!(15));
    }

    #[test]
    fn test_zero_values_rejected() {
        let err = HubConfig::from_yaml_str("executor:\n  max_blocking_workers: 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key, .. } if key == "executor.max_blocking_workers"
        ));
    }

    #[test]
    fn test_entry_without_domain_rejected() {
        let yaml = "entries:\n  - domain: demo\n  - domain: \"  \"\n    title: Broken\n";
        let err = HubConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEntry { index: 1, .. }));
    }

    #[test]
    fn test_load_resolves_config_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hub.yaml");
        fs::write(&path, "config_dir: data\n").unwrap();

        let config = HubConfig::load(&path).unwrap();
        assert_eq!(config.config_dir, dir.path().join("data"));
    }

    #[test]
    fn test_load_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hub.yaml");
        fs::write(&path, "").unwrap();

        let config = HubConfig::load(&path).unwrap();
        assert_eq!(config.config_dir, dir.path().join("."));
    }
}
