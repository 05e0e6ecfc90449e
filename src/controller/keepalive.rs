//! Application-level keepalive.
//!
//! While connected, a single zero byte is published to the client's keepalive topic
//! every 28 minutes so idle connections are not torn down by NATs and carriers, and so
//! a silently dead link is noticed.

use std::time::Duration;
use tracing::debug;

use super::command::Command;
use crate::mqtt::Qos;
use crate::platform::{TimerId, TimerService};

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(28 * 60);
pub const KEEP_ALIVE_PAYLOAD: [u8; 1] = [0];
pub const KEEP_ALIVE_QOS: Qos = Qos::AtMostOnce;
pub const KEEP_ALIVE_RETAIN: bool = false;

pub fn keepalive_topic(client_id: &str) -> String {
    format!("/users/{}/keepalive", client_id)
}

/// Owns the one repeating keepalive timer.
#[derive(Clone, Copy, Debug)]
pub struct KeepaliveScheduler {
    pub period: Duration,
}

impl Default for KeepaliveScheduler {
    fn default() -> Self {
        Self {
            period: KEEP_ALIVE_INTERVAL,
        }
    }
}

impl KeepaliveScheduler {
    /// Arms the repeating timer, replacing any previous schedule.
    pub fn start(&self, timers: &mut dyn TimerService) {
        timers.cancel(TimerId::Keepalive);
        timers.schedule_repeating(TimerId::Keepalive, self.period, Command::KeepaliveTick);
        debug!("Keepalive every {:?}", self.period);
    }

    pub fn stop(&self, timers: &mut dyn TimerService) {
        timers.cancel(TimerId::Keepalive);
    }

    pub fn has_schedule(&self, timers: &dyn TimerService) -> bool {
        timers.is_scheduled(TimerId::Keepalive)
    }
}
