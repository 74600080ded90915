//! Config entry state machine
//!
//! ```text
//! NotLoaded → SetupInProgress → Loaded
//!                            ↘ SetupError → SetupInProgress (manual retry)
//!                            ↘ SetupRetry → SetupInProgress (scheduled retry)
//!                            ↘ MigrationError (terminal)
//!
//! Loaded/SetupError/SetupRetry → UnloadInProgress → NotLoaded
//!                                                 ↘ Loaded (partial unload)
//!                                                 ↘ FailedUnload (terminal)
//! ```

use crate::entry::ConfigEntryState;
use std::time::Duration;
use thiserror::Error;

/// Upper bound of the random jitter added to setup retry delays
const RETRY_JITTER_MS: u64 = 100;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid state transition from {from} to {to}: {reason}")]
pub struct InvalidTransition {
    pub from: ConfigEntryState,
    pub to: ConfigEntryState,
    pub reason: &'static str,
}

impl ConfigEntryState {
    pub fn try_transition(
        self,
        to: ConfigEntryState,
    ) -> Result<ConfigEntryState, InvalidTransition> {
        use ConfigEntryState::*;

        let valid = matches!(
            (self, to),
            (NotLoaded, SetupInProgress)
                | (SetupInProgress, Loaded)
                | (SetupInProgress, SetupError)
                | (SetupInProgress, SetupRetry)
                | (SetupInProgress, MigrationError)
                | (SetupError, SetupInProgress)
                | (SetupError, UnloadInProgress)
                | (SetupRetry, SetupInProgress)
                | (SetupRetry, UnloadInProgress)
                | (Loaded, UnloadInProgress)
                | (UnloadInProgress, NotLoaded)
                | (UnloadInProgress, Loaded)
                | (UnloadInProgress, FailedUnload)
        );

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition {
                from: self,
                to,
                reason: rejection_reason(self, to),
            })
        }
    }

    pub fn can_transition_to(self, to: ConfigEntryState) -> bool {
        self.try_transition(to).is_ok()
    }
}

fn rejection_reason(from: ConfigEntryState, to: ConfigEntryState) -> &'static str {
    use ConfigEntryState::*;

    match (from, to) {
        (MigrationError, _) => "migration error is terminal",
        (FailedUnload, _) => "failed unload is terminal",
        (SetupInProgress, _) => "setup still in progress",
        (UnloadInProgress, _) => "unload still in progress",
        (NotLoaded, _) => "entry must be set up first",
        (Loaded, SetupInProgress) => "already loaded, unload first",
        (Loaded, _) => "entry must be unloaded first",
        _ => "not a lifecycle transition",
    }
}

/// Delay before setup attempt `tries + 1`: `base * 2^min(tries, max_exponent)`
/// plus up to 100ms of jitter
pub fn retry_delay(tries: u32, base: Duration, max_exponent: u32) -> Duration {
    let factor = 1u32 << tries.min(max_exponent).min(16);
    let jitter = Duration::from_millis(rand::random::<u64>() % RETRY_JITTER_MS);
    base.saturating_mul(factor).saturating_add(jitter)
}
