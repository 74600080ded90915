//! YAML loading with `!secret` and `!env_var` substitution
//!
//! - `!secret key` is replaced by the value of `key` in `secrets.yaml`,
//!   looked up next to the file being loaded
//! - `!env_var VAR` is replaced by the environment variable; `!env_var VAR
//!   fallback` uses `fallback` when the variable is unset

use crate::error::{ConfigError, ConfigResult};
use serde_yaml::value::TaggedValue;
use serde_yaml::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Secrets loaded from `secrets.yaml`
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    secrets: HashMap<String, String>,
}

impl Secrets {
    /// Load `<dir>/secrets.yaml`; a missing file yields no secrets
    pub fn load(dir: &Path) -> ConfigResult<Self> {
        let path = dir.join("secrets.yaml");
        if !path.exists() {
            debug!("No secrets.yaml found at {:?}", path);
            return Ok(Self::default());
        }

        let content = read(&path)?;
        let raw: HashMap<String, Value> =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseYaml {
                path: path.clone(),
                source,
            })?;

        let secrets: HashMap<String, String> = raw
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    Value::Null => String::new(),
                    other => serde_yaml::to_string(&other)
                        .unwrap_or_default()
                        .trim()
                        .to_string(),
                };
                (key, value)
            })
            .collect();

        debug!("Loaded {} secrets from {:?}", secrets.len(), path);
        Ok(Self { secrets })
    }

    pub fn get(&self, key: &str) -> ConfigResult<&str> {
        self.secrets
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::SecretNotFound {
                key: key.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

fn read(path: &Path) -> ConfigResult<String> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a YAML file and resolve its custom tags
pub fn load_yaml(path: impl AsRef<Path>) -> ConfigResult<Value> {
    let path = path.as_ref();
    debug!("Loading YAML file: {:?}", path);
    let content = read(path)?;
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    load_yaml_str(&content, path, &Secrets::load(&dir)?)
}

/// Parse YAML text and resolve its custom tags
pub fn load_yaml_str(content: &str, source: &Path, secrets: &Secrets) -> ConfigResult<Value> {
    let value: Value = serde_yaml::from_str(content).map_err(|err| ConfigError::ParseYaml {
        path: PathBuf::from(source),
        source: err,
    })?;
    resolve(value, secrets)
}

fn resolve(value: Value, secrets: &Secrets) -> ConfigResult<Value> {
    match value {
        Value::Tagged(tagged) => resolve_tagged(*tagged, secrets),
        Value::Mapping(map) => {
            let mut resolved = serde_yaml::Mapping::new();
            for (k, v) in map {
                resolved.insert(resolve(k, secrets)?, resolve(v, secrets)?);
            }
            Ok(Value::Mapping(resolved))
        }
        Value::Sequence(seq) => Ok(Value::Sequence(
            seq.into_iter()
                .map(|v| resolve(v, secrets))
                .collect::<ConfigResult<_>>()?,
        )),
        other => Ok(other),
    }
}

fn resolve_tagged(tagged: TaggedValue, secrets: &Secrets) -> ConfigResult<Value> {
    let tag = tagged.tag.to_string();
    trace!("Processing tag '{}'", tag);

    match tag.as_str() {
        "!secret" => {
            let key = tag_argument(&tag, tagged.value)?;
            let value = secrets.get(&key)?;
            debug!("Substituted secret: {}", key);
            Ok(Value::String(value.to_string()))
        }
        "!env_var" => {
            let argument = tag_argument(&tag, tagged.value)?;
            let (var, fallback) = match argument.split_once(char::is_whitespace) {
                Some((var, fallback)) => (var.to_string(), Some(fallback.trim().to_string())),
                None => (argument, None),
            };
            match (std::env::var(&var), fallback) {
                (Ok(value), _) => Ok(Value::String(value)),
                (Err(_), Some(fallback)) => Ok(Value::String(fallback)),
                (Err(_), None) => Err(ConfigError::EnvVarNotFound { var }),
            }
        }
        _ => Ok(Value::Tagged(Box::new(TaggedValue {
            tag: tagged.tag,
            value: resolve(tagged.value, secrets)?,
        }))),
    }
}

fn tag_argument(tag: &str, value: Value) -> ConfigResult<String> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(ConfigError::InvalidValue {
            key: tag.to_string(),
            reason: "argument must be a string".to_string(),
        }),
    }
}
