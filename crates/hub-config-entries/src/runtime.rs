//! Runtime of one loaded config entry
//!
//! An [`EntryHandle`] is created for each setup attempt and records what
//! the integration starts: forwarded platforms, coordinators, unload
//! callbacks and runtime data. Teardown releases all of it, so a failed
//! setup and a successful unload leave nothing running.

use crate::context::HubContext;
use crate::entry::ConfigEntry;
use crate::error::ConfigEntryError;
use crate::integration::LoadedIntegration;
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use hub_coordinator::{Coordinator, UpdateError};
use hub_core::PlatformDomain;
use hub_entity::{EntityPlatform, PlatformInfo};
use indexmap::IndexMap;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Starts reauthentication for an entry; receives the rejection reason
pub(crate) type ReauthTrigger = Arc<dyn Fn(&str) + Send + Sync>;

type UnloadCallback = Box<dyn FnOnce() + Send>;

/// Type-erased coordinator owned by an entry
#[async_trait]
pub trait ManagedCoordinator: Send + Sync {
    fn name(&self) -> &str;
    fn listener_count(&self) -> usize;
    fn is_polling(&self) -> bool;
    async fn shutdown(&self);
}

#[async_trait]
impl<T: Send + Sync + 'static> ManagedCoordinator for Coordinator<T> {
    fn name(&self) -> &str {
        Coordinator::name(self)
    }

    fn listener_count(&self) -> usize {
        Coordinator::listener_count(self)
    }

    fn is_polling(&self) -> bool {
        Coordinator::is_polling(self)
    }

    async fn shutdown(&self) {
        Coordinator::shutdown(self).await
    }
}

struct EntryRuntime {
    hub: Arc<HubContext>,
    integration: Arc<LoadedIntegration>,
    entry: RwLock<ConfigEntry>,
    platforms: Mutex<IndexMap<PlatformDomain, Arc<EntityPlatform>>>,
    setup_tasks: Mutex<JoinSet<()>>,
    coordinators: Mutex<Vec<Arc<dyn ManagedCoordinator>>>,
    on_unload: Mutex<Vec<UnloadCallback>>,
    runtime_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    reauth: ReauthTrigger,
}

/// What an integration gets while setting up or unloading an entry
#[derive(Clone)]
pub struct EntryHandle {
    inner: Arc<EntryRuntime>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl EntryHandle {
    pub(crate) fn new(
        hub: Arc<HubContext>,
        integration: Arc<LoadedIntegration>,
        entry: ConfigEntry,
        reauth: ReauthTrigger,
    ) -> Self {
        Self {
            inner: Arc::new(EntryRuntime {
                hub,
                integration,
                entry: RwLock::new(entry),
                platforms: Mutex::new(IndexMap::new()),
                setup_tasks: Mutex::new(JoinSet::new()),
                coordinators: Mutex::new(Vec::new()),
                on_unload: Mutex::new(Vec::new()),
                runtime_data: Mutex::new(None),
                reauth,
            }),
        }
    }

    pub fn hub(&self) -> &Arc<HubContext> {
        &self.inner.hub
    }

    /// Snapshot of the entry record
    pub fn entry(&self) -> ConfigEntry {
        self.inner
            .entry
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub(crate) fn refresh_entry(&self, entry: ConfigEntry) {
        *self.inner.entry.write().unwrap_or_else(|p| p.into_inner()) = entry;
    }

    pub fn entry_id(&self) -> String {
        self.entry().entry_id
    }

    pub fn domain(&self) -> &str {
        self.inner.integration.domain()
    }

    pub(crate) fn integration(&self) -> &Arc<LoadedIntegration> {
        &self.inner.integration
    }

    /// Set up the given platforms concurrently and wait for all of them
    ///
    /// Each platform runs as its own task. The first platform error is
    /// returned once every task has finished. Nothing is started when one
    /// of the domains has no platform.
    pub async fn forward_entry_setups(
        &self,
        domains: &[PlatformDomain],
    ) -> Result<(), ConfigEntryError> {
        let entry = self.entry();
        let platforms = domains
            .iter()
            .map(|&domain| {
                self.inner
                    .integration
                    .platform(domain)
                    .map(|platform| (domain, platform))
                    .ok_or_else(|| {
                        ConfigEntryError::failed(format!(
                            "integration {} has no {} platform",
                            self.domain(),
                            domain
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut pending = Vec::with_capacity(platforms.len());

        for (domain, platform) in platforms {
            if lock(&self.inner.platforms).contains_key(&domain) {
                warn!(entry_id = %entry.entry_id, %domain, "Platform already set up");
                continue;
            }

            let entity_platform = EntityPlatform::new(
                PlatformInfo {
                    domain,
                    platform: self.domain().to_string(),
                    config_entry_id: Some(entry.entry_id.clone()),
                    pref_disable_new_entities: entry.pref_disable_new_entities,
                },
                self.inner.hub.entity_services(),
            );
            lock(&self.inner.platforms).insert(domain, Arc::clone(&entity_platform));

            let handle = self.clone();
            let add_entities = entity_platform.add_entities_callback();
            let (done, outcome) = oneshot::channel();
            lock(&self.inner.setup_tasks).spawn(async move {
                let setup = platform.setup_entry(&handle, add_entities);
                let result = match AssertUnwindSafe(setup).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(ConfigEntryError::failed("platform setup panicked")),
                };
                let _ = done.send(result);
            });
            pending.push((domain, outcome));
        }

        let results = join_all(
            pending
                .into_iter()
                .map(|(domain, outcome)| async move { (domain, outcome.await) }),
        )
        .await;

        let mut first_error = None;
        for (domain, result) in results {
            // A dropped sender means teardown aborted the task
            let outcome = result
                .unwrap_or_else(|_| Err(ConfigEntryError::failed("platform setup cancelled")));
            match outcome {
                Ok(()) => debug!(entry_id = %entry.entry_id, %domain, "Platform set up"),
                Err(err) => {
                    error!(
                        entry_id = %entry.entry_id,
                        %domain,
                        "Error setting up platform: {}",
                        err
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Unload the given platforms; true only if every one of them unloaded
    ///
    /// Platforms that unload have their entities removed. Platforms that
    /// refuse stay loaded with their entities intact.
    pub async fn unload_platforms(&self, domains: &[PlatformDomain]) -> bool {
        let loaded: Vec<_> = {
            let platforms = lock(&self.inner.platforms);
            domains
                .iter()
                .filter_map(|d| platforms.get(d).map(|p| (*d, Arc::clone(p))))
                .collect()
        };

        let results = join_all(loaded.into_iter().map(|(domain, entity_platform)| async move {
            let unloaded = match self.inner.integration.platform(domain) {
                Some(platform) => platform.unload_entry(self).await,
                None => Ok(true),
            };
            match unloaded {
                Ok(true) => {
                    entity_platform.reset().await;
                    lock(&self.inner.platforms).shift_remove(&domain);
                    true
                }
                Ok(false) => {
                    warn!(domain = %domain, "Platform did not unload");
                    false
                }
                Err(err) => {
                    error!(domain = %domain, "Error unloading platform: {}", err);
                    false
                }
            }
        }))
        .await;

        results.into_iter().all(|ok| ok)
    }

    /// Platforms currently set up for this entry
    pub fn loaded_platforms(&self) -> Vec<PlatformDomain> {
        lock(&self.inner.platforms).keys().copied().collect()
    }

    pub fn platform(&self, domain: PlatformDomain) -> Option<Arc<EntityPlatform>> {
        lock(&self.inner.platforms).get(&domain).cloned()
    }

    /// Tie a coordinator to this entry: it is shut down on unload, and
    /// rejected credentials during background refreshes start reauth
    pub fn register_coordinator<T: Send + Sync + 'static>(&self, coordinator: &Coordinator<T>) {
        let reauth = Arc::clone(&self.inner.reauth);
        coordinator.set_auth_failed_hook(Arc::new(move |err: &UpdateError| {
            reauth(&err.to_string());
        }));
        if self.entry().pref_disable_polling {
            debug!(coordinator = %coordinator.name(), "Polling disabled for entry");
            coordinator.set_update_interval(None);
        }
        lock(&self.inner.coordinators).push(Arc::new(coordinator.clone()));
    }

    /// Run `callback` when the entry unloads or its setup fails
    pub fn on_unload(&self, callback: impl FnOnce() + Send + 'static) {
        lock(&self.inner.on_unload).push(Box::new(callback));
    }

    pub fn set_runtime_data<T: Any + Send + Sync>(&self, data: T) {
        *lock(&self.inner.runtime_data) = Some(Arc::new(data));
    }

    pub fn runtime_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        lock(&self.inner.runtime_data)
            .clone()
            .and_then(|data| data.downcast::<T>().ok())
    }

    /// Listeners still attached to this entry's coordinators
    pub fn listener_count(&self) -> usize {
        lock(&self.inner.coordinators)
            .iter()
            .map(|c| c.listener_count())
            .sum()
    }

    /// Coordinators of this entry with a running refresh timer
    pub fn polling_coordinators(&self) -> usize {
        lock(&self.inner.coordinators)
            .iter()
            .filter(|c| c.is_polling())
            .count()
    }

    pub fn coordinator_count(&self) -> usize {
        lock(&self.inner.coordinators).len()
    }

    /// Release everything the entry started
    ///
    /// Platform setups still running are cancelled and awaited before any
    /// platform is reset.
    pub(crate) async fn teardown(&self) {
        let mut setups = std::mem::take(&mut *lock(&self.inner.setup_tasks));
        setups.abort_all();
        while setups.join_next().await.is_some() {}

        let platforms: Vec<_> = lock(&self.inner.platforms).drain(..).collect();
        for (_, platform) in &platforms {
            platform.reset().await;
        }

        let coordinators: Vec<_> = lock(&self.inner.coordinators).drain(..).collect();
        join_all(coordinators.iter().map(|c| c.shutdown())).await;

        let callbacks: Vec<_> = lock(&self.inner.on_unload).drain(..).collect();
        for callback in callbacks.into_iter().rev() {
            if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!(domain = %self.domain(), "Unload callback panicked");
            }
        }
        lock(&self.inner.runtime_data).take();

        info!(
            domain = %self.domain(),
            platforms = platforms.len(),
            coordinators = coordinators.len(),
            "Entry runtime torn down"
        );
    }
}

impl std::fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryHandle")
            .field("entry_id", &self.entry_id())
            .field("domain", &self.domain())
            .field("platforms", &self.loaded_platforms())
            .finish()
    }
}
