use chrono::{DateTime, Utc};
use std::fmt;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    AwaitingRetry,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::AwaitingRetry => "awaiting-retry",
        }
    }

    /// True for every state in which the user wants a connection.
    pub fn is_active(&self) -> bool {
        !matches!(self, LinkState::Idle)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live broker session as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    /// Generation of the connect attempt that produced this session.
    pub attempt: u64,
    pub connected_at: DateTime<Utc>,
}

/// Process-local controller state. Never persisted.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    pub session: Option<SessionHandle>,
    /// When the current session, or the current streak of attempts, began.
    pub session_started_at: DateTime<Utc>,
    pub keepalive_topic: Option<String>,
    /// Generation of the most recent connect attempt.
    pub attempt: u64,
    pub subscribed_topic: Option<String>,
    /// A stop is waiting for the network worker to finish disconnecting.
    pub stopping: bool,
    /// A start or stop outcome still has to be reported to the listener.
    pub pending_report: bool,
}

impl RuntimeState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            session: None,
            session_started_at: now,
            keepalive_topic: None,
            attempt: 0,
            subscribed_topic: None,
            stopping: false,
            pending_report: false,
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn next_attempt(&mut self) -> u64 {
        self.attempt += 1;
        self.attempt
    }
}
