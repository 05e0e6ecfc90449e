//! Wake-up timers that feed commands back into the controller mailbox.
//!
//! Timers are keyed by a stable [`TimerId`]. Arming an id that is already armed replaces
//! the previous timer, and cancelling an id that is not armed does nothing.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::controller::command::{Command, CommandSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    Keepalive,
    Retry,
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TimerId::Keepalive => write!(f, "keepalive"),
            TimerId::Retry => write!(f, "retry"),
        }
    }
}

pub trait TimerService: Send {
    /// Fires `command` once after `delay`.
    fn schedule_once(&mut self, id: TimerId, delay: Duration, command: Command);

    /// Fires `command` every `period`, the first time one period from now.
    fn schedule_repeating(&mut self, id: TimerId, period: Duration, command: Command);

    fn cancel(&mut self, id: TimerId);

    fn is_scheduled(&self, id: TimerId) -> bool;
}

struct Armed {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Timers backed by tokio tasks. Must be used from within a tokio runtime.
pub struct TokioTimers {
    sender: CommandSender,
    armed: HashMap<TimerId, Armed>,
}

impl TokioTimers {
    pub fn new(sender: CommandSender) -> Self {
        Self {
            sender,
            armed: HashMap::new(),
        }
    }

    fn arm(&mut self, id: TimerId, token: CancellationToken, task: JoinHandle<()>) {
        if let Some(previous) = self.armed.insert(id, Armed { token, task }) {
            debug!("Replacing armed {} timer", id);
            previous.token.cancel();
        }
    }
}

impl TimerService for TokioTimers {
    fn schedule_once(&mut self, id: TimerId, delay: Duration, command: Command) {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let sender = self.sender.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = sleep(delay) => {
                    debug!("{} timer fired", id);
                    if sender.send(command).is_err() {
                        warn!("{} timer fired after the controller stopped", id);
                    }
                }
            }
        });

        debug!("Armed {} timer in {:?}", id, delay);
        self.arm(id, token, task);
    }

    fn schedule_repeating(&mut self, id: TimerId, period: Duration, command: Command) {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let sender = self.sender.clone();

        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticks.tick() => {
                        debug!("{} timer fired", id);
                        if sender.send(command.clone()).is_err() {
                            warn!("{} timer fired after the controller stopped", id);
                            break;
                        }
                    }
                }
            }
        });

        debug!("Armed repeating {} timer every {:?}", id, period);
        self.arm(id, token, task);
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(armed) = self.armed.remove(&id) {
            debug!("Cancelled {} timer", id);
            armed.token.cancel();
        }
    }

    fn is_scheduled(&self, id: TimerId) -> bool {
        self.armed
            .get(&id)
            .map(|armed| !armed.task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.token.cancel();
        }
    }
}
