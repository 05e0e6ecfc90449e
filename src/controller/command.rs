//! Everything that enters the controller mailbox.

use tokio::sync::mpsc;

use super::controller_handle::ControllerError;
use super::net_worker::JobOutcome;
use crate::mqtt::{BrokerEvent, ConnectionConfig};

/// External triggers: user requests, timer fires and reachability edges.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Stop,
    Subscribe(String),
    Publish { topic: String, payload: Vec<u8> },
    KeepaliveTick,
    RetryTick,
    ReachabilityChanged(bool),
    Configure(ConnectionConfig),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Subscribe(_) => "subscribe",
            Command::Publish { .. } => "publish",
            Command::KeepaliveTick => "keepalive-tick",
            Command::RetryTick => "retry-tick",
            Command::ReachabilityChanged(_) => "reachability-changed",
            Command::Configure(_) => "configure",
        }
    }
}

#[derive(Debug)]
pub enum Input {
    Command(Command),
    /// Callback from the session opened by connect attempt `attempt`.
    Broker { attempt: u64, event: BrokerEvent },
    /// Completion of a network job.
    Job(JobOutcome),
}

/// Cloneable sending side of the controller mailbox.
#[derive(Clone, Debug)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Input>,
}

impl CommandSender {
    pub fn send(&self, command: Command) -> Result<(), ControllerError> {
        self.input(Input::Command(command))
    }

    pub(crate) fn input(&self, input: Input) -> Result<(), ControllerError> {
        self.tx
            .send(input)
            .map_err(|_| ControllerError::ChannelClosed)
    }
}

pub fn command_channel() -> (CommandSender, mpsc::UnboundedReceiver<Input>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandSender { tx }, rx)
}
