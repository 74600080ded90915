//! Shared data-update coordinator
//!
//! A [`Coordinator`] owns one integration's fetch loop: a single in-flight
//! refresh at a time, the latest payload, failure accounting with backoff,
//! and a [`ListenerRegistry`] of subscribers notified after every update.

mod backoff;
mod coordinator;
mod debounce;
mod error;
mod listeners;

pub use backoff::Backoff;
pub use coordinator::{
    AuthFailedHook, Coordinator, CoordinatorBuilder, CoordinatorSettings, CoordinatorUpdate,
    Trigger, UpdateMethod, WeakCoordinator,
};
pub use debounce::{DebouncedFn, Debouncer};
pub use error::UpdateError;
pub use listeners::{Listener, ListenerHandle, ListenerRegistry};
