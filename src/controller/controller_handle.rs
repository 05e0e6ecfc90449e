//! Controller Handle - spawns and drives the lifecycle controller
//!
//! Wires the two tasks that make up a running controller:
//!
//! ```text
//! CommandSender ─[Input]→ controller actor ─[NetJob]→ network worker ─→ BrokerClient
//!                               ▲                           │
//!                               └──────[JobOutcome]─────────┘
//! ```
//!
//! The actor runs `recover_from_restart` before it reads its first input, so commands
//! queued before `spawn` are handled after recovery.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::command::{Command, CommandSender, Input};
use super::controller::{Controller, ControllerSettings, Services};
use super::net_worker::NetWorker;
use super::state::LinkState;
use crate::mqtt::{BrokerClient, ConnectionConfig};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// The controller mailbox is closed, the actor has stopped.
    #[error("Controller is not running")]
    ChannelClosed,

    #[error("Controller task failed: {0}")]
    TaskFailed(String),
}

/// Handle to a running controller.
///
/// Dropping the handle leaves the tasks running; call [`ControllerHandle::shutdown`] to
/// stop them. Shutdown leaves the durable started flag alone, so the next process start
/// reconnects.
pub struct ControllerHandle {
    sender: CommandSender,
    state: watch::Receiver<LinkState>,
    shutdown: CancellationToken,
    actor: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl ControllerHandle {
    pub fn spawn(
        sender: CommandSender,
        inbox: mpsc::UnboundedReceiver<Input>,
        services: Services,
        broker: Box<dyn BrokerClient>,
        settings: ControllerSettings,
    ) -> Self {
        info!("Initializing connection controller with settings: {:?}", settings);

        let (jobs, worker) = NetWorker::spawn(broker, sender.clone(), settings.connect_timeout);
        debug!("Network worker spawned");

        let controller = Controller::new(services, jobs, settings);
        let (state_tx, state) = watch::channel(controller.state());
        let shutdown = CancellationToken::new();

        let actor = tokio::spawn(run_actor(controller, inbox, state_tx, shutdown.clone()));
        info!("Connection controller spawned");

        Self {
            sender,
            state,
            shutdown,
            actor,
            worker,
        }
    }

    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Receiver that sees every state the controller settles in.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    pub fn start(&self) -> Result<(), ControllerError> {
        self.sender.send(Command::Start)
    }

    pub fn stop(&self) -> Result<(), ControllerError> {
        self.sender.send(Command::Stop)
    }

    pub fn subscribe(&self, topic: impl Into<String>) -> Result<(), ControllerError> {
        self.sender.send(Command::Subscribe(topic.into()))
    }

    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), ControllerError> {
        self.sender.send(Command::Publish {
            topic: topic.into(),
            payload: payload.into(),
        })
    }

    pub fn configure(&self, config: ConnectionConfig) -> Result<(), ControllerError> {
        self.sender.send(Command::Configure(config))
    }

    /// Stops the actor, then lets the network worker close any open session.
    pub async fn shutdown(self, grace: Duration) -> Result<(), ControllerError> {
        info!("Shutting down connection controller");
        self.shutdown.cancel();

        self.actor
            .await
            .map_err(|e| ControllerError::TaskFailed(e.to_string()))?;

        match tokio::time::timeout(grace, self.worker).await {
            Ok(joined) => joined.map_err(|e| ControllerError::TaskFailed(e.to_string()))?,
            Err(_) => warn!("Network worker did not finish within {:?}", grace),
        }
        info!("Connection controller stopped");
        Ok(())
    }
}

async fn run_actor(
    mut controller: Controller,
    mut inbox: mpsc::UnboundedReceiver<Input>,
    state: watch::Sender<LinkState>,
    shutdown: CancellationToken,
) {
    controller.recover_from_restart();
    state.send_replace(controller.state());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            input = inbox.recv() => match input {
                Some(input) => {
                    controller.handle(input);
                    state.send_replace(controller.state());
                }
                None => break,
            }
        }
    }

    info!("Controller actor stopped while {}", controller.state());
}
