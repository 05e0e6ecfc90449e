//! Network worker.
//!
//! Owns the broker client and runs jobs strictly one after another, so a disconnect
//! queued behind a connect always sees the finished connect. Every outcome goes back
//! into the controller mailbox; the controller itself never awaits the network.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::command::{CommandSender, Input};
use crate::mqtt::{
    BrokerCallback, BrokerClient, BrokerError, ConnectRequest, DeliveryToken, Qos,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPurpose {
    Keepalive,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Stop,
    Unreachable,
}

#[derive(Debug)]
pub enum NetJob {
    Connect {
        attempt: u64,
        request: ConnectRequest,
        /// Subscribed at QoS 1 right after the connect succeeds.
        topic: Option<String>,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
        purpose: PublishPurpose,
    },
    Disconnect {
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Connected {
        attempt: u64,
        subscribed: Option<String>,
    },
    ConnectFailed {
        attempt: u64,
        error: BrokerError,
    },
    Subscribed {
        topic: String,
        result: Result<(), BrokerError>,
    },
    Unsubscribed {
        topic: String,
        result: Result<(), BrokerError>,
    },
    Published {
        purpose: PublishPurpose,
        result: Result<DeliveryToken, BrokerError>,
    },
    Disconnected {
        reason: DisconnectReason,
        result: Result<(), BrokerError>,
    },
}

pub type JobSender = mpsc::UnboundedSender<NetJob>;

pub struct NetWorker {
    client: Box<dyn BrokerClient>,
    jobs: mpsc::UnboundedReceiver<NetJob>,
    outcomes: CommandSender,
    connect_timeout: Duration,
}

impl NetWorker {
    pub fn spawn(
        client: Box<dyn BrokerClient>,
        outcomes: CommandSender,
        connect_timeout: Duration,
    ) -> (JobSender, JoinHandle<()>) {
        let (tx, jobs) = mpsc::unbounded_channel();
        let worker = Self {
            client,
            jobs,
            outcomes,
            connect_timeout,
        };
        (tx, tokio::spawn(worker.run()))
    }

    async fn run(mut self) {
        debug!("Network worker started");
        while let Some(job) = self.jobs.recv().await {
            let outcome = self.execute(job).await;
            if self.outcomes.input(Input::Job(outcome)).is_err() {
                debug!("Controller mailbox closed, dropping job outcome");
            }
        }

        if self.client.is_connected() {
            info!("Network worker shutting down, closing open session");
            if let Err(e) = self.client.disconnect().await {
                warn!("Disconnect during shutdown failed: {}", e);
            }
        }
        debug!("Network worker finished");
    }

    fn callback(&self, attempt: u64) -> BrokerCallback {
        let sender = self.outcomes.clone();
        Arc::new(move |event| {
            if sender.input(Input::Broker { attempt, event }).is_err() {
                debug!("Controller mailbox closed, dropping broker event");
            }
        })
    }

    async fn execute(&mut self, job: NetJob) -> JobOutcome {
        match job {
            NetJob::Connect {
                attempt,
                request,
                topic,
            } => self.connect(attempt, request, topic).await,
            NetJob::Subscribe { topic } => {
                let result = self.client.subscribe(&topic, Qos::AtLeastOnce).await;
                JobOutcome::Subscribed { topic, result }
            }
            NetJob::Unsubscribe { topic } => {
                let result = self.client.unsubscribe(&topic).await;
                JobOutcome::Unsubscribed { topic, result }
            }
            NetJob::Publish {
                topic,
                payload,
                qos,
                retain,
                purpose,
            } => {
                let result = self.client.publish(&topic, payload, qos, retain).await;
                JobOutcome::Published { purpose, result }
            }
            NetJob::Disconnect { reason } => {
                let result = self.client.disconnect().await;
                JobOutcome::Disconnected { reason, result }
            }
        }
    }

    async fn connect(
        &mut self,
        attempt: u64,
        request: ConnectRequest,
        topic: Option<String>,
    ) -> JobOutcome {
        let callback = self.callback(attempt);
        let limit = self.connect_timeout;

        let connected = tokio::time::timeout(limit, self.client.connect(request, callback)).await;
        let error = match connected {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(BrokerError::Timeout(limit)),
        };
        if let Some(error) = error {
            debug!("Connect attempt {} failed: {}", attempt, error);
            return JobOutcome::ConnectFailed { attempt, error };
        }

        let subscribed = match topic {
            Some(topic) => match self.client.subscribe(&topic, Qos::AtLeastOnce).await {
                Ok(()) => Some(topic),
                Err(e) => {
                    warn!("Connected but subscribing {} failed: {}", topic, e);
                    None
                }
            },
            None => None,
        };

        JobOutcome::Connected {
            attempt,
            subscribed,
        }
    }
}
