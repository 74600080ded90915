//! Shared polling coordinator
//!
//! One [`Coordinator`] fetches data for an integration and fans the result
//! out to every subscribed entity. Concurrent refreshes are coalesced into a
//! single fetch, failures keep the last good payload, and the refresh timer
//! only runs while someone is listening.

use crate::backoff::Backoff;
use crate::debounce::{DebouncedFn, Debouncer};
use crate::error::UpdateError;
use crate::listeners::{ListenerHandle, ListenerRegistry};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use hub_core::Context;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Async fetch function returning the coordinator payload
pub type UpdateMethod<T> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<T, UpdateError>> + Send + Sync>;

/// Called when a refresh outside of setup hits rejected credentials
pub type AuthFailedHook = Arc<dyn Fn(&UpdateError) + Send + Sync>;

/// Capacity of the update broadcast channel
const UPDATE_CHANNEL_CAPACITY: usize = 16;

/// Tunables shared by every coordinator on a hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Upper bound on a single fetch
    pub request_timeout: Duration,
    /// Debounce window for [`Coordinator::request_refresh`]
    pub cooldown: Duration,
    /// Run the first debounced request right away
    pub immediate: bool,
    /// Ceiling for the failure backoff
    pub max_backoff: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            cooldown: Duration::from_secs(10),
            immediate: true,
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// What started a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The refresh timer fired
    Scheduled,
    /// Direct call to refresh / try_refresh
    Manual,
    /// The debounced request_refresh path
    Requested,
    /// First refresh during entry setup
    FirstRefresh,
}

/// Broadcast after every committed update
#[derive(Debug, Clone)]
pub struct CoordinatorUpdate {
    pub coordinator: String,
    pub success: bool,
    pub context: Context,
}

struct UpdateState<T> {
    data: Option<Arc<T>>,
    last_update_success: bool,
    last_exception: Option<UpdateError>,
    last_update_success_time: Option<DateTime<Utc>>,
    failures: u32,
    context: Option<Context>,
    update_interval: Option<Duration>,
}

struct Inner<T> {
    name: String,
    update_method: UpdateMethod<T>,
    settings: CoordinatorSettings,
    backoff: Backoff,
    /// Equality used to suppress no-op notifications; `None` always notifies
    data_eq: Option<fn(&T, &T) -> bool>,
    state: RwLock<UpdateState<T>>,
    listeners: ListenerRegistry,
    refresh_lock: tokio::sync::Mutex<()>,
    /// Bumped after every completed fetch
    generation: AtomicU64,
    last_result: Mutex<Result<(), UpdateError>>,
    shut_down: AtomicBool,
    debouncer: Debouncer,
    timer: Mutex<Option<JoinHandle<()>>>,
    reschedule: Arc<Notify>,
    auth_failed_hook: RwLock<Option<AuthFailedHook>>,
    updates: broadcast::Sender<CoordinatorUpdate>,
}

/// Handle on a shared coordinator; clones refer to the same instance
pub struct Coordinator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Coordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Coordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

/// Non-owning reference to a coordinator, for callbacks the coordinator
/// itself keeps alive
pub struct WeakCoordinator<T> {
    inner: Weak<Inner<T>>,
}

impl<T> WeakCoordinator<T> {
    pub fn upgrade(&self) -> Option<Coordinator<T>> {
        self.inner.upgrade().map(|inner| Coordinator { inner })
    }
}

impl<T> Clone for WeakCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Coordinator<T> {
    /// Start building a coordinator around an async fetch function
    pub fn builder<F, Fut>(name: impl Into<String>, update_method: F) -> CoordinatorBuilder<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, UpdateError>> + Send + 'static,
    {
        CoordinatorBuilder {
            name: name.into(),
            update_method: Arc::new(move || update_method().boxed()),
            update_interval: None,
            settings: CoordinatorSettings::default(),
            data_eq: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn downgrade(&self) -> WeakCoordinator<T> {
        WeakCoordinator {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Refresh now, joining a fetch already in flight; errors are recorded
    /// on the coordinator and not returned
    pub async fn refresh(&self) {
        let _ = self.inner.refresh(Trigger::Manual).await;
    }

    /// Like [`refresh`](Self::refresh) but returns the shared outcome
    pub async fn try_refresh(&self) -> Result<(), UpdateError> {
        self.inner.refresh(Trigger::Manual).await
    }

    /// First refresh of an entry being set up; failures are returned so
    /// setup can decide between retry and error
    pub async fn config_entry_first_refresh(&self) -> Result<(), UpdateError> {
        self.inner.refresh(Trigger::FirstRefresh).await
    }

    /// Debounced refresh request; returns immediately
    pub fn request_refresh(&self) {
        if self.inner.is_shut_down() {
            return;
        }
        self.inner.debouncer.call();
    }

    /// Push a payload without fetching
    pub fn set_updated_data(&self, data: T) {
        if self.inner.is_shut_down() {
            return;
        }
        self.inner.commit(Ok(data), Trigger::Manual, Context::new());
        self.inner.reschedule.notify_one();
    }

    /// Record a failure reported by a push source
    pub fn set_update_error(&self, error: UpdateError) {
        if self.inner.is_shut_down() {
            return;
        }
        self.inner.commit(Err(error), Trigger::Manual, Context::new());
    }

    /// Change or clear the polling interval at runtime
    pub fn set_update_interval(&self, interval: Option<Duration>) {
        self.inner.write_state().update_interval = interval;
        match interval {
            Some(_) if !self.inner.listeners.is_empty() => {
                self.inner.ensure_timer();
                self.inner.reschedule.notify_one();
            }
            Some(_) => {}
            None => self.inner.stop_timer(),
        }
    }

    pub fn update_interval(&self) -> Option<Duration> {
        self.inner.read_state().update_interval
    }

    /// Delay until the next scheduled refresh, including failure backoff
    pub fn next_interval(&self) -> Option<Duration> {
        self.inner.next_interval()
    }

    /// Latest successful payload
    pub fn data(&self) -> Option<Arc<T>> {
        self.inner.read_state().data.clone()
    }

    pub fn last_update_success(&self) -> bool {
        self.inner.read_state().last_update_success
    }

    pub fn last_exception(&self) -> Option<UpdateError> {
        self.inner.read_state().last_exception.clone()
    }

    pub fn last_update_success_time(&self) -> Option<DateTime<Utc>> {
        self.inner.read_state().last_update_success_time
    }

    /// Consecutive failures since the last success
    pub fn failure_count(&self) -> u32 {
        self.inner.read_state().failures
    }

    /// Context of the most recent committed update
    pub fn update_context(&self) -> Option<Context> {
        self.inner.read_state().context.clone()
    }

    /// Subscribe a callback to every update
    ///
    /// The first listener starts the refresh timer; removing the last one
    /// stops it.
    pub fn add_listener(
        &self,
        callback: impl Fn() + Send + Sync + 'static,
        context: Option<String>,
    ) -> ListenerHandle {
        self.inner.listeners.add_listener(callback, context)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Contexts registered by the current listeners
    pub fn contexts(&self) -> HashSet<String> {
        self.inner.listeners.contexts()
    }

    /// Receive a [`CoordinatorUpdate`] after every commit
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn set_auth_failed_hook(&self, hook: AuthFailedHook) {
        *self
            .inner
            .auth_failed_hook
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(hook);
    }

    /// True while the refresh timer task is alive
    pub fn is_polling(&self) -> bool {
        self.inner
            .lock_timer()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    /// Stop the timer and any pending debounced request, and drop all
    /// listeners; later refreshes are no-ops
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending = self.inner.debouncer.shutdown();
        let timer = self.inner.lock_timer().take();
        if let Some(timer) = &timer {
            timer.abort();
        }
        self.inner.listeners.clear();

        for task in [pending, timer].into_iter().flatten() {
            let _ = task.await;
        }
        debug!(coordinator = %self.inner.name, "Coordinator shut down");
    }
}

impl<T: Send + Sync + 'static> Inner<T> {
    fn read_state(&self) -> RwLockReadGuard<'_, UpdateState<T>> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, UpdateState<T>> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn last_result(&self) -> Result<(), UpdateError> {
        self.last_result
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn next_interval(&self) -> Option<Duration> {
        let state = self.read_state();
        state
            .update_interval
            .map(|interval| self.backoff.interval(interval, state.failures))
    }

    async fn refresh(self: &Arc<Self>, trigger: Trigger) -> Result<(), UpdateError> {
        if self.is_shut_down() {
            return Ok(());
        }

        let seen = self.generation.load(Ordering::SeqCst);
        let _guard = self.refresh_lock.lock().await;
        if self.generation.load(Ordering::SeqCst) != seen {
            // A fetch finished while we waited; share its outcome
            return self.last_result();
        }
        if self.is_shut_down() {
            return Ok(());
        }

        let context = Context::new();
        let started = Instant::now();
        let timeout = self.settings.request_timeout;
        let outcome = match tokio::time::timeout(timeout, (self.update_method)()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(UpdateError::Timeout(timeout)),
        };
        debug!(
            coordinator = %self.name,
            ?trigger,
            "Finished fetching {} data in {:.3} seconds (success: {})",
            self.name,
            started.elapsed().as_secs_f64(),
            outcome.is_ok()
        );

        let result = self.commit(outcome, trigger, context);
        *self.last_result.lock().unwrap_or_else(|p| p.into_inner()) = result.clone();
        self.generation.fetch_add(1, Ordering::SeqCst);

        if trigger != Trigger::Scheduled {
            self.reschedule.notify_one();
        }
        result
    }

    /// Record an outcome and notify listeners
    fn commit(
        &self,
        outcome: Result<T, UpdateError>,
        trigger: Trigger,
        context: Context,
    ) -> Result<(), UpdateError> {
        let (notify, result) = {
            let mut state = self.write_state();
            let was_successful = state.last_update_success;
            state.context = Some(context.clone());

            match outcome {
                Ok(data) => {
                    let unchanged = match (&state.data, self.data_eq) {
                        (Some(old), Some(eq)) => was_successful && eq(old, &data),
                        _ => false,
                    };
                    if !was_successful {
                        info!("Fetching {} data recovered", self.name);
                    }
                    state.data = Some(Arc::new(data));
                    state.last_update_success = true;
                    state.last_exception = None;
                    state.failures = 0;
                    state.last_update_success_time = Some(Utc::now());
                    (!unchanged, Ok(()))
                }
                Err(err) => {
                    if was_successful {
                        error!("Error fetching {} data: {}", self.name, err);
                    } else {
                        debug!("Error fetching {} data: {}", self.name, err);
                    }
                    state.last_update_success = false;
                    state.last_exception = Some(err.clone());
                    state.failures = state.failures.saturating_add(1);
                    (true, Err(err))
                }
            }
        };

        if let Err(err) = &result {
            if err.is_auth_failure() && trigger != Trigger::FirstRefresh {
                let hook = self
                    .auth_failed_hook
                    .read()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone();
                match hook {
                    Some(hook) => hook(err),
                    None => warn!(coordinator = %self.name, "Authentication failed with no reauth handler"),
                }
            }
        }

        if notify {
            self.listeners.notify_all();
        }
        let _ = self.updates.send(CoordinatorUpdate {
            coordinator: self.name.clone(),
            success: result.is_ok(),
            context,
        });
        result
    }

    fn on_listener_count(self: &Arc<Self>, count: usize) {
        if count == 0 {
            self.stop_timer();
        } else {
            self.ensure_timer();
        }
    }

    fn ensure_timer(self: &Arc<Self>) {
        if self.is_shut_down() || self.read_state().update_interval.is_none() {
            return;
        }
        let mut timer = self.lock_timer();
        if timer.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(coordinator = %self.name, "No async runtime, refresh timer not started");
            return;
        };
        debug!(coordinator = %self.name, "Starting refresh timer");
        *timer = Some(runtime.spawn(timer_loop(
            Arc::downgrade(self),
            Arc::clone(&self.reschedule),
        )));
    }

    fn stop_timer(&self) {
        if let Some(task) = self.lock_timer().take() {
            debug!(coordinator = %self.name, "Stopping refresh timer");
            task.abort();
        }
    }
}

async fn timer_loop<T: Send + Sync + 'static>(inner: Weak<Inner<T>>, reschedule: Arc<Notify>) {
    loop {
        let Some(delay) = inner.upgrade().and_then(|inner| inner.next_interval()) else {
            return;
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            // Refreshed out of band; measure the interval from now
            _ = reschedule.notified() => continue,
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.is_shut_down() {
            return;
        }
        let _ = inner.refresh(Trigger::Scheduled).await;
    }
}

/// Builder for [`Coordinator`]
pub struct CoordinatorBuilder<T> {
    name: String,
    update_method: UpdateMethod<T>,
    update_interval: Option<Duration>,
    settings: CoordinatorSettings,
    data_eq: Option<fn(&T, &T) -> bool>,
}

impl<T: Send + Sync + 'static> CoordinatorBuilder<T> {
    /// Poll every `interval` while listeners exist
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    /// Never poll; data arrives via [`Coordinator::set_updated_data`] or
    /// explicit refreshes
    pub fn push_only(mut self) -> Self {
        self.update_interval = None;
        self
    }

    pub fn settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.settings.request_timeout = timeout;
        self
    }

    pub fn request_refresh_debounce(mut self, cooldown: Duration, immediate: bool) -> Self {
        self.settings.cooldown = cooldown;
        self.settings.immediate = immediate;
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.settings.max_backoff = max_backoff;
        self
    }

    pub fn build(self) -> Coordinator<T> {
        let CoordinatorBuilder {
            name,
            update_method,
            update_interval,
            settings,
            data_eq,
        } = self;
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<T>>| {
            let hook_ref = weak.clone();
            let listeners = ListenerRegistry::with_count_hook(name.clone(), move |count| {
                if let Some(inner) = hook_ref.upgrade() {
                    inner.on_listener_count(count);
                }
            });

            let debounce_ref = weak.clone();
            let function: DebouncedFn = Arc::new(move || {
                let inner = debounce_ref.clone();
                async move {
                    if let Some(inner) = inner.upgrade() {
                        let _ = inner.refresh(Trigger::Requested).await;
                    }
                }
                .boxed()
            });
            let debouncer = Debouncer::new(
                format!("{} refresh", name),
                settings.cooldown,
                settings.immediate,
                function,
            );

            Inner {
                name,
                update_method,
                settings,
                backoff: Backoff::new(settings.max_backoff),
                data_eq,
                state: RwLock::new(UpdateState {
                    data: None,
                    last_update_success: true,
                    last_exception: None,
                    last_update_success_time: None,
                    failures: 0,
                    context: None,
                    update_interval,
                }),
                listeners,
                refresh_lock: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                last_result: Mutex::new(Ok(())),
                shut_down: AtomicBool::new(false),
                debouncer,
                timer: Mutex::new(None),
                reschedule: Arc::new(Notify::new()),
                auth_failed_hook: RwLock::new(None),
                updates,
            }
        });

        Coordinator { inner }
    }
}

impl<T: PartialEq + Send + Sync + 'static> CoordinatorBuilder<T> {
    /// With `false`, a successful refresh that returns data equal to the
    /// current payload does not notify listeners
    pub fn always_update(mut self, always: bool) -> Self {
        self.data_eq = if always { None } else { Some(<T as PartialEq>::eq) };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Fetch function replaying a script, then repeating its last entry
    fn scripted(
        script: Vec<Result<i32, UpdateError>>,
    ) -> (
        Arc<AtomicUsize>,
        impl Fn() -> BoxFuture<'static, Result<i32, UpdateError>> + Send + Sync + 'static,
    ) {
        let calls = Arc::new(AtomicUsize::new(0));
        let script = Arc::new(Mutex::new(VecDeque::from(script)));
        let counter = Arc::clone(&calls);
        let fetch = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    script.front().cloned().unwrap()
                }
            };
            Box::pin(async move { next }) as BoxFuture<'static, _>
        };
        (calls, fetch)
    }

    fn listener_counter(coordinator: &Coordinator<i32>) -> (Arc<AtomicUsize>, ListenerHandle) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = coordinator.add_listener(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
        (count, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_share_one_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let coordinator = Coordinator::builder("station", move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(n as i32 + 7)
            }
        })
        .build();

        let results =
            futures::future::join_all((0..8).map(|_| coordinator.try_refresh())).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(coordinator.data().as_deref(), Some(&7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_share_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let coordinator: Coordinator<i32> = Coordinator::builder("station", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                Err(UpdateError::failed("device busy"))
            }
        })
        .build();

        let results =
            futures::future::join_all((0..4).map(|_| coordinator.try_refresh())).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result, Err(UpdateError::failed("device busy")));
        }
        assert_eq!(coordinator.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_last_good_data() {
        let (_calls, fetch) = scripted(vec![
            Ok(21),
            Err(UpdateError::failed("timeout talking to station")),
            Ok(22),
        ]);
        let coordinator = Coordinator::builder("station", fetch).build();

        coordinator.refresh().await;
        assert_eq!(coordinator.data().as_deref(), Some(&21));
        assert!(coordinator.last_update_success());
        let first_success = coordinator.last_update_success_time();
        assert!(first_success.is_some());

        coordinator.refresh().await;
        assert_eq!(coordinator.data().as_deref(), Some(&21));
        assert!(!coordinator.last_update_success());
        assert!(coordinator.last_exception().is_some());
        assert_eq!(coordinator.failure_count(), 1);
        assert_eq!(coordinator.last_update_success_time(), first_success);

        coordinator.refresh().await;
        assert_eq!(coordinator.data().as_deref(), Some(&22));
        assert!(coordinator.last_update_success());
        assert!(coordinator.last_exception().is_none());
        assert_eq!(coordinator.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_try_refresh_reports_outcome() {
        let (calls, fetch) = scripted(vec![Err(UpdateError::failed("offline")), Ok(3)]);
        let coordinator = Coordinator::builder("station", fetch).build();

        let err = tokio_test::assert_err!(coordinator.try_refresh().await);
        assert!(!err.is_auth_failure());
        tokio_test::assert_ok!(coordinator.try_refresh().await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.data().as_deref(), Some(&3));
    }

    #[tokio::test]
    async fn test_every_listener_notified_per_update() {
        let (_calls, fetch) = scripted(vec![Ok(1), Err(UpdateError::failed("x")), Ok(2)]);
        let coordinator = Coordinator::builder("station", fetch).push_only().build();

        let listeners: Vec<_> = (0..3).map(|_| listener_counter(&coordinator)).collect();
        for _ in 0..3 {
            coordinator.refresh().await;
        }
        for (count, _handle) in &listeners {
            assert_eq!(count.load(Ordering::SeqCst), 3);
        }
    }

    #[tokio::test]
    async fn test_always_update_false_suppresses_equal_data() {
        let (_calls, fetch) = scripted(vec![Ok(5), Ok(5), Ok(6)]);
        let coordinator = Coordinator::builder("station", fetch)
            .always_update(false)
            .build();
        let (count, _handle) = listener_counter(&coordinator);

        coordinator.refresh().await;
        coordinator.refresh().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        coordinator.refresh().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_always_update_default_notifies_equal_data() {
        let (_calls, fetch) = scripted(vec![Ok(5)]);
        let coordinator = Coordinator::builder("station", fetch).build();
        let (count, _handle) = listener_counter(&coordinator);

        coordinator.refresh().await;
        coordinator.refresh().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_is_a_failure() {
        let coordinator: Coordinator<i32> = Coordinator::builder("slow", || async {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(1)
        })
        .request_timeout(Duration::from_secs(5))
        .build();

        let result = coordinator.try_refresh().await;
        assert_eq!(result, Err(UpdateError::Timeout(Duration::from_secs(5))));
        assert!(!coordinator.last_update_success());
        assert!(coordinator.data().is_none());
    }

    #[tokio::test]
    async fn test_backoff_grows_and_resets() {
        let mut script: Vec<_> = (0..6).map(|_| Err(UpdateError::failed("down"))).collect();
        script.push(Ok(1));
        let (_calls, fetch) = scripted(script);
        let coordinator = Coordinator::builder("station", fetch)
            .update_interval(Duration::from_secs(30))
            .max_backoff(Duration::from_secs(300))
            .build();

        assert_eq!(coordinator.next_interval(), Some(Duration::from_secs(30)));
        let mut previous = Duration::ZERO;
        for _ in 0..6 {
            coordinator.refresh().await;
            let next = coordinator.next_interval().unwrap();
            assert!(next >= previous);
            assert!(next <= Duration::from_secs(300));
            previous = next;
        }
        assert_eq!(previous, Duration::from_secs(300));

        coordinator.refresh().await;
        assert_eq!(coordinator.next_interval(), Some(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_runs_only_while_listened() {
        let (calls, fetch) = scripted(vec![Ok(1)]);
        let coordinator = Coordinator::builder("station", fetch)
            .update_interval(Duration::from_secs(10))
            .build();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!coordinator.is_polling());

        let (_count, handle) = listener_counter(&coordinator);
        assert!(coordinator.is_polling());
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        drop(handle);
        assert!(!coordinator.is_polling());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_only_never_polls() {
        let (calls, fetch) = scripted(vec![Ok(1)]);
        let coordinator = Coordinator::builder("push", fetch).push_only().build();
        let (count, _handle) = listener_counter(&coordinator);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!coordinator.is_polling());

        coordinator.set_updated_data(42);
        assert_eq!(coordinator.data().as_deref(), Some(&42));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let pushed = coordinator.update_context().unwrap();

        coordinator.set_update_error(UpdateError::failed("socket closed"));
        assert_eq!(coordinator.data().as_deref(), Some(&42));
        assert!(!coordinator.last_update_success());
        assert_eq!(
            coordinator.last_exception(),
            Some(UpdateError::failed("socket closed"))
        );
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_ne!(coordinator.update_context().unwrap().id, pushed.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requested_refreshes_are_debounced() {
        let (calls, fetch) = scripted(vec![Ok(1)]);
        let coordinator = Coordinator::builder("station", fetch)
            .request_refresh_debounce(Duration::from_secs(10), false)
            .build();

        for _ in 0..5 {
            coordinator.request_refresh();
        }
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_request_refresh_runs_leading_edge() {
        let (calls, fetch) = scripted(vec![Ok(1)]);
        let coordinator = Coordinator::builder("station", fetch)
            .request_refresh_debounce(Duration::from_secs(10), true)
            .build();

        coordinator.request_refresh();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        coordinator.request_refresh();
        coordinator.request_refresh();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_calls_hook_outside_setup() {
        let (_calls, fetch) = scripted(vec![
            Err(UpdateError::auth_failed("bad token")),
            Err(UpdateError::auth_failed("bad token")),
        ]);
        let coordinator = Coordinator::builder("station", fetch).build();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        coordinator.set_auth_failed_hook(Arc::new(move |_err| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        let first = coordinator.config_entry_first_refresh().await;
        assert!(first.unwrap_err().is_auth_failure());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        coordinator.refresh().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_everything() {
        let (calls, fetch) = scripted(vec![Ok(1)]);
        let coordinator = Coordinator::builder("station", fetch)
            .update_interval(Duration::from_secs(10))
            .build();
        let (_count, handle) = listener_counter(&coordinator);
        let mut updates = coordinator.subscribe();

        coordinator.refresh().await;
        assert!(updates.recv().await.unwrap().success);

        coordinator.shutdown().await;
        assert_eq!(coordinator.listener_count(), 0);
        assert!(!handle.is_active());
        assert!(!coordinator.is_polling());

        coordinator.refresh().await;
        coordinator.request_refresh();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_contexts() {
        let (_calls, fetch) = scripted(vec![Ok(1)]);
        let coordinator = Coordinator::builder("station", fetch).build();
        let _a = coordinator.add_listener(|| {}, Some("temperature".to_string()));
        let _b = coordinator.add_listener(|| {}, Some("humidity".to_string()));

        let contexts = coordinator.contexts();
        assert!(contexts.contains("temperature"));
        assert!(contexts.contains("humidity"));
    }
}
