//! Listener registry
//!
//! Synchronous callbacks invoked after every coordinator update. Each
//! registration returns a [`ListenerHandle`]; dropping the handle or calling
//! [`ListenerHandle::unsubscribe`] removes the registration, any number of
//! times.

use std::collections::{BTreeMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{error, trace};

/// Callback invoked on every notification
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Hook told the listener count after every add/remove
type CountHook = Box<dyn Fn(usize) + Send + Sync>;

struct Registration {
    callback: Listener,
    context: Option<String>,
}

struct Shared {
    name: String,
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, Registration>>,
    on_count_change: Option<CountHook>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Registration>> {
        self.listeners.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn remove(&self, id: u64) {
        let remaining = {
            let mut listeners = self.lock();
            if listeners.remove(&id).is_none() {
                return;
            }
            listeners.len()
        };
        trace!(registry = %self.name, id, remaining, "Listener removed");
        if let Some(hook) = &self.on_count_change {
            hook(remaining);
        }
    }
}

/// Set of listener callbacks with snapshot-based notification
pub struct ListenerRegistry {
    shared: Arc<Shared>,
}

impl ListenerRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    /// Registry that reports its size after each change
    pub fn with_count_hook(
        name: impl Into<String>,
        hook: impl Fn(usize) + Send + Sync + 'static,
    ) -> Self {
        Self::build(name.into(), Some(Box::new(hook)))
    }

    fn build(name: String, on_count_change: Option<CountHook>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(BTreeMap::new()),
                on_count_change,
            }),
        }
    }

    /// Register a callback, optionally tagged with a context
    pub fn add_listener(
        &self,
        callback: impl Fn() + Send + Sync + 'static,
        context: Option<String>,
    ) -> ListenerHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut listeners = self.shared.lock();
            listeners.insert(
                id,
                Registration {
                    callback: Arc::new(callback),
                    context,
                },
            );
            listeners.len()
        };
        trace!(registry = %self.shared.name, id, count, "Listener added");
        if let Some(hook) = &self.shared.on_count_change {
            hook(count);
        }

        ListenerHandle {
            id,
            registry: Arc::downgrade(&self.shared),
        }
    }

    /// Invoke every listener registered at the time of the call
    ///
    /// Iterates a snapshot, so listeners may add or remove registrations
    /// (including their own) while being notified. A panicking listener is
    /// logged and does not stop delivery to the rest. Returns the number of
    /// listeners that completed normally.
    pub fn notify_all(&self) -> usize {
        let snapshot: Vec<(u64, Listener)> = self
            .shared
            .lock()
            .iter()
            .map(|(id, reg)| (*id, Arc::clone(&reg.callback)))
            .collect();

        let mut delivered = 0;
        for (id, callback) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback())) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(registry = %self.shared.name, id, "Error in listener callback: {}", message);
                }
            }
        }
        delivered
    }

    /// Contexts of the current listeners
    pub fn contexts(&self) -> HashSet<String> {
        self.shared
            .lock()
            .values()
            .filter_map(|reg| reg.context.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration; outstanding handles become no-ops
    pub fn clear(&self) {
        let had_any = {
            let mut listeners = self.shared.lock();
            let had_any = !listeners.is_empty();
            listeners.clear();
            had_any
        };
        if had_any {
            if let Some(hook) = &self.shared.on_count_change {
                hook(0);
            }
        }
    }
}

/// Capability to remove exactly one registration
///
/// Removal happens on [`unsubscribe`](Self::unsubscribe) or on drop,
/// whichever comes first; later calls are no-ops.
#[must_use = "dropping the handle removes the listener"]
pub struct ListenerHandle {
    id: u64,
    registry: Weak<Shared>,
}

impl ListenerHandle {
    pub fn unsubscribe(&self) {
        if let Some(shared) = self.registry.upgrade() {
            shared.remove(self.id);
        }
    }

    /// True while the registration is still present
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .map(|shared| shared.lock().contains_key(&self.id))
            .unwrap_or(false)
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_each_listener_notified_once() {
        let registry = ListenerRegistry::new("test");
        let counts: Vec<_> = (0..5)
            .map(|_| {
                let (count, cb) = counter();
                (count, registry.add_listener(cb, None))
            })
            .collect();

        assert_eq!(registry.notify_all(), 5);
        for (count, _handle) in &counts {
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let registry = ListenerRegistry::new("test");
        let (count, cb) = counter();
        let handle = registry.add_listener(cb, None);

        handle.unsubscribe();
        handle.unsubscribe();
        assert!(!handle.is_active());
        drop(handle);

        registry.notify_all();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_self_unsubscribe_during_notification() {
        let registry = ListenerRegistry::new("test");
        let slot: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));

        let (self_count, self_cb) = counter();
        let slot_cb = Arc::clone(&slot);
        let handle = registry.add_listener(
            move || {
                self_cb();
                if let Some(handle) = slot_cb.lock().unwrap().as_ref() {
                    handle.unsubscribe();
                }
            },
            None,
        );
        *slot.lock().unwrap() = Some(handle);

        let others: Vec<_> = (0..3)
            .map(|_| {
                let (count, cb) = counter();
                (count, registry.add_listener(cb, None))
            })
            .collect();

        assert_eq!(registry.notify_all(), 4);
        assert_eq!(self_count.load(Ordering::SeqCst), 1);
        for (count, _h) in &others {
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }

        registry.notify_all();
        assert_eq!(self_count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let registry = ListenerRegistry::new("test");
        let _bad = registry.add_listener(|| panic!("listener blew up"), None);
        let (count, cb) = counter();
        let _good = registry.add_listener(cb, None);

        assert_eq!(registry.notify_all(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_contexts_and_count_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_hook = Arc::clone(&seen);
        let registry =
            ListenerRegistry::with_count_hook("test", move |n| seen_hook.lock().unwrap().push(n));

        let a = registry.add_listener(|| {}, Some("outdoor".to_string()));
        let b = registry.add_listener(|| {}, Some("indoor".to_string()));
        let c = registry.add_listener(|| {}, None);

        let contexts = registry.contexts();
        assert_eq!(contexts.len(), 2);
        assert!(contexts.contains("outdoor"));

        drop(a);
        b.unsubscribe();
        drop(b);
        registry.clear();
        c.unsubscribe();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 2, 1, 0]);
    }
}
