//! Binding between an entity and its coordinator
//!
//! [`CoordinatorEntity`] is embedded in a concrete entity. On attach it
//! subscribes the entity's handle to the coordinator and renders right away;
//! on detach it drops the subscription. Availability follows the
//! coordinator's last refresh.

use crate::description::{render_value, EntityDescription, ValueDescription};
use crate::entity::Entity;
use crate::error::EntityResult;
use crate::handle::EntityHandle;
use async_trait::async_trait;
use hub_coordinator::{Coordinator, ListenerHandle};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

pub struct CoordinatorEntity<T> {
    coordinator: Coordinator<T>,
    /// Passed to the coordinator so fetch code can limit what it requests
    context: Option<String>,
    subscription: Mutex<Option<ListenerHandle>>,
}

impl<T: Send + Sync + 'static> CoordinatorEntity<T> {
    pub fn new(coordinator: Coordinator<T>) -> Self {
        Self::with_context(coordinator, None)
    }

    pub fn with_context(coordinator: Coordinator<T>, context: Option<String>) -> Self {
        Self {
            coordinator,
            context,
            subscription: Mutex::new(None),
        }
    }

    pub fn coordinator(&self) -> &Coordinator<T> {
        &self.coordinator
    }

    /// Latest successful payload
    pub fn data(&self) -> Option<Arc<T>> {
        self.coordinator.data()
    }

    /// False whenever the coordinator's last refresh failed
    pub fn available(&self) -> bool {
        self.coordinator.last_update_success()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ListenerHandle>> {
        self.subscription.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Subscribe the handle to coordinator updates and render current data
    pub fn attach(&self, handle: &EntityHandle) {
        let listener = handle.clone();
        let coordinator = self.coordinator.downgrade();
        let subscription = self.coordinator.add_listener(
            move || {
                let cause = coordinator.upgrade().and_then(|c| c.update_context());
                listener.coordinator_updated(cause.as_ref());
            },
            self.context.clone(),
        );
        trace!(
            entity_id = %handle.entity_id(),
            coordinator = %self.coordinator.name(),
            "Attached to coordinator"
        );

        let previous = self.lock().replace(subscription);
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
        if self.coordinator.data().is_some() {
            handle.coordinator_updated(self.coordinator.update_context().as_ref());
        }
    }

    /// Drop the subscription; safe without a prior attach
    pub fn detach(&self) {
        if let Some(subscription) = self.lock().take() {
            subscription.unsubscribe();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.lock().as_ref().is_some_and(|s| s.is_active())
    }

    /// Entity update: refresh the coordinator, joining a fetch already in
    /// flight
    ///
    /// Fetch errors stay on the coordinator and show up as unavailability.
    pub async fn update(&self) {
        self.coordinator.refresh().await;
    }
}

/// Read-only entity whose value comes straight from coordinator data
///
/// Covers the common sensor / binary sensor case: a [`ValueDescription`]
/// extracts the value, and `unique_id` is `<device_id>_<key>`.
pub struct CoordinatorValueEntity<T> {
    binding: CoordinatorEntity<T>,
    description: ValueDescription<T>,
    unique_id: String,
}

impl<T: Send + Sync + 'static> CoordinatorValueEntity<T> {
    pub fn new(
        coordinator: Coordinator<T>,
        device_id: &str,
        description: ValueDescription<T>,
    ) -> Self {
        let unique_id = format!("{}_{}", device_id, description.key());
        let context = Some(description.key().to_string());
        Self {
            binding: CoordinatorEntity::with_context(coordinator, context),
            description,
            unique_id,
        }
    }

    pub fn binding(&self) -> &CoordinatorEntity<T> {
        &self.binding
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Entity for CoordinatorValueEntity<T> {
    fn unique_id(&self) -> Option<String> {
        Some(self.unique_id.clone())
    }

    fn description(&self) -> Option<&EntityDescription> {
        Some(&self.description.entity)
    }

    fn state(&self) -> Option<String> {
        let data = self.binding.data()?;
        self.description.value(&data).as_ref().and_then(render_value)
    }

    fn available(&self) -> bool {
        self.binding.available()
            && self
                .binding
                .data()
                .map_or(true, |data| self.description.is_available(&data))
    }

    async fn update(&self) -> EntityResult<()> {
        self.binding.update().await;
        Ok(())
    }

    async fn added_to_hub(&self, handle: EntityHandle) {
        self.binding.attach(&handle);
    }

    async fn will_remove_from_hub(&self) {
        self.binding.detach();
    }
}
