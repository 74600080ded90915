//! Debouncer for refresh requests
//!
//! The first call either runs the function right away (`immediate`) or
//! arms it for the end of the cooldown. Calls made while a cooldown is
//! running collapse into a single run at the end of that cooldown.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// The debounced async function
pub type DebouncedFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct DebounceState {
    /// Cooldown task; `Some` while a cooldown is running
    task: Option<JoinHandle<()>>,
    execute_at_end: bool,
    shut_down: bool,
}

pub struct Debouncer {
    name: String,
    cooldown: Duration,
    immediate: bool,
    function: DebouncedFn,
    state: Arc<Mutex<DebounceState>>,
}

fn lock(state: &Mutex<DebounceState>) -> MutexGuard<'_, DebounceState> {
    state.lock().unwrap_or_else(|p| p.into_inner())
}

impl Debouncer {
    pub fn new(
        name: impl Into<String>,
        cooldown: Duration,
        immediate: bool,
        function: DebouncedFn,
    ) -> Self {
        Self {
            name: name.into(),
            cooldown,
            immediate,
            function,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Request a run; never waits for it
    pub fn call(&self) {
        let mut state = lock(&self.state);
        if state.shut_down {
            return;
        }
        if state.task.is_some() {
            trace!(debouncer = %self.name, "Call collapsed into pending run");
            state.execute_at_end = true;
            return;
        }

        let run_now = self.immediate;
        if !run_now {
            state.execute_at_end = true;
        }

        let function = Arc::clone(&self.function);
        let shared = Arc::clone(&self.state);
        let cooldown = self.cooldown;
        state.task = Some(tokio::spawn(async move {
            if run_now {
                function().await;
            }
            cooldown_loop(shared, function, cooldown).await;
        }));
    }

    /// True while calls would be collapsed
    pub fn is_cooling_down(&self) -> bool {
        lock(&self.state).task.is_some()
    }

    /// Drop any pending run without shutting down
    pub fn cancel(&self) -> Option<JoinHandle<()>> {
        let mut state = lock(&self.state);
        state.execute_at_end = false;
        let task = state.task.take();
        if let Some(task) = &task {
            task.abort();
        }
        task
    }

    /// Cancel and refuse further calls; returns the aborted task to await
    pub fn shutdown(&self) -> Option<JoinHandle<()>> {
        lock(&self.state).shut_down = true;
        self.cancel()
    }
}

async fn cooldown_loop(
    state: Arc<Mutex<DebounceState>>,
    function: DebouncedFn,
    cooldown: Duration,
) {
    loop {
        tokio::time::sleep(cooldown).await;

        let run = {
            let mut state = lock(&state);
            if state.execute_at_end && !state.shut_down {
                state.execute_at_end = false;
                true
            } else {
                state.task = None;
                false
            }
        };
        if !run {
            return;
        }
        function().await;
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<AtomicUsize>, DebouncedFn) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let function: DebouncedFn = Arc::new(move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        (count, function)
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_calls_collapse() {
        let (count, function) = counting();
        let debouncer = Debouncer::new("test", Duration::from_secs(10), false, function);

        for _ in 0..5 {
            debouncer.call();
        }
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_cooling_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_runs_leading_and_trailing() {
        let (count, function) = counting();
        let debouncer = Debouncer::new("test", Duration::from_secs(10), true, function);

        debouncer.call();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        for _ in 0..4 {
            debouncer.call();
        }
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending_run() {
        let (count, function) = counting();
        let debouncer = Debouncer::new("test", Duration::from_secs(10), false, function);

        debouncer.call();
        if let Some(task) = debouncer.shutdown() {
            let _ = task.await;
        }
        debouncer.call();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
