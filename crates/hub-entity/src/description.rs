//! Entity descriptions
//!
//! A description is the static metadata of one kind of entity an integration
//! exposes (key, display name, unit, ...). [`ValueDescription`] adds the pure
//! function that extracts the entity's value from coordinator data.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Secondary entity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    Config,
    Diagnostic,
}

/// Static metadata for an entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDescription {
    /// Stable key, combined with a device identifier into the unique id
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<EntityCategory>,
}

impl EntityDescription {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn device_class(mut self, device_class: impl Into<String>) -> Self {
        self.device_class = Some(device_class.into());
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit_of_measurement = Some(unit.into());
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn category(mut self, category: EntityCategory) -> Self {
        self.entity_category = Some(category);
        self
    }
}

type ValueFn<T> = Arc<dyn Fn(&T) -> Option<Value> + Send + Sync>;
type AvailableFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Description plus value extraction from a coordinator payload of type `T`
///
/// `value_fn` must be pure: no I/O, no interior state.
pub struct ValueDescription<T> {
    pub entity: EntityDescription,
    value_fn: ValueFn<T>,
    available_fn: Option<AvailableFn<T>>,
}

impl<T> ValueDescription<T> {
    pub fn new(
        entity: EntityDescription,
        value_fn: impl Fn(&T) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            entity,
            value_fn: Arc::new(value_fn),
            available_fn: None,
        }
    }

    /// Narrow availability further, e.g. when a sub-device is missing from
    /// the payload
    pub fn with_available(
        mut self,
        available_fn: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.available_fn = Some(Arc::new(available_fn));
        self
    }

    pub fn key(&self) -> &str {
        &self.entity.key
    }

    pub fn value(&self, data: &T) -> Option<Value> {
        (self.value_fn)(data)
    }

    pub fn is_available(&self, data: &T) -> bool {
        self.available_fn.as_ref().map_or(true, |f| f(data))
    }
}

impl<T> Clone for ValueDescription<T> {
    fn clone(&self) -> Self {
        Self {
            entity: self.entity.clone(),
            value_fn: Arc::clone(&self.value_fn),
            available_fn: self.available_fn.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ValueDescription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueDescription")
            .field("entity", &self.entity)
            .field("narrows_availability", &self.available_fn.is_some())
            .finish()
    }
}

/// Render a JSON value as a state string
///
/// Booleans become `on`/`off`; `null` means no value.
pub fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(true) => Some("on".to_string()),
        Value::Bool(false) => Some("off".to_string()),
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
