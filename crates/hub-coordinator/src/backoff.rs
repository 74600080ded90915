//! Failure backoff for the refresh timer
//!
//! After `n` consecutive failures the next refresh is scheduled
//! `interval * 2^n` later, capped at `max(max_interval, interval)`. One
//! success resets the cadence to the nominal interval.

use std::time::Duration;

/// Doublings beyond this are always capped anyway
const MAX_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    max_interval: Duration,
}

impl Backoff {
    pub fn new(max_interval: Duration) -> Self {
        Self { max_interval }
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    /// Delay before the next refresh given the consecutive failure count
    pub fn interval(&self, nominal: Duration, failures: u32) -> Duration {
        if failures == 0 {
            return nominal;
        }
        let cap = self.max_interval.max(nominal);
        let factor = 1u32 << failures.min(MAX_EXPONENT);
        nominal.saturating_mul(factor).min(cap)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
