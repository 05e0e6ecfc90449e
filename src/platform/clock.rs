use chrono::{DateTime, Utc};

/// Wall-clock source for the lifecycle controller.
///
/// Backoff decisions compare wall-clock timestamps, so tests swap in a manual clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
