//! Reconnect backoff.
//!
//! The delay grows while attempts keep failing quickly and snaps back to the initial
//! value once a session has outlived the delay that preceded it.

use std::time::Duration;

pub const INITIAL_RETRY_INTERVAL: Duration = Duration::from_secs(10);
pub const MAXIMUM_RETRY_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const MULTIPLIER: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub maximum: Duration,
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: INITIAL_RETRY_INTERVAL,
            maximum: MAXIMUM_RETRY_INTERVAL,
            multiplier: MULTIPLIER,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt.
    ///
    /// `elapsed` is the time since the current session (or attempt streak) began.
    pub fn next_interval(&self, previous: Duration, elapsed: Duration) -> Duration {
        if elapsed < previous {
            previous
                .checked_mul(self.multiplier)
                .map_or(self.maximum, |grown| grown.min(self.maximum))
        } else {
            self.initial
        }
    }
}

/// [`BackoffPolicy::next_interval`] with the default constants.
pub fn next_interval(previous: Duration, elapsed: Duration) -> Duration {
    BackoffPolicy::default().next_interval(previous, elapsed)
}
