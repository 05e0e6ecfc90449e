//! rumqttc-backed implementation of the broker client seam.
//!
//! `connect` drives the rumqttc event loop inline until CONNACK so the caller gets a
//! definite answer, then hands the event loop to a background task that keeps polling
//! and translates packets into [`BrokerEvent`]s.
//!
//! ```text
//! NetWorker ──connect/publish/...──► RumqttBroker ──► AsyncClient ──► EventLoop task
//!                                                                         │
//!                 controller mailbox ◄──── BrokerCallback ◄───────────────┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::{
    BrokerCallback, BrokerClient, BrokerEvent, ConnectRequest, DeliveryToken, Qos,
};
use super::error::BrokerError;
use super::message_manager::MqttMessage;
use super::session_store::{OutboundRecord, SessionStore};

/// Tuning for the rumqttc client.
#[derive(Clone, Debug)]
pub struct BrokerSettings {
    /// Protocol-level keep alive. The application-level keepalive runs on top of this.
    pub keep_alive: Duration,
    /// Request channel capacity between `AsyncClient` and the event loop.
    pub channel_capacity: usize,
    /// How long `disconnect` waits for the event loop to flush DISCONNECT.
    pub disconnect_grace: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            channel_capacity: 100,
            disconnect_grace: Duration::from_secs(5),
        }
    }
}

/// In-flight bookkeeping for QoS 1/2 publishes.
///
/// rumqttc assigns packet ids inside the event loop, in request order, so records wait
/// in `awaiting_pkid` until the matching `Outgoing::Publish(pkid)` shows up. Tokens
/// continue after the highest id already in the store so leftover records keep theirs.
#[derive(Debug)]
struct Outbox {
    store: SessionStore,
    next_token: u64,
    awaiting_pkid: VecDeque<u64>,
    in_flight: HashMap<u16, u64>,
}

impl Outbox {
    fn new(store: SessionStore) -> Self {
        Self {
            next_token: store.last_id(),
            store,
            awaiting_pkid: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }

    fn next_token(&mut self) -> DeliveryToken {
        self.next_token += 1;
        DeliveryToken(self.next_token)
    }

    fn assign(&mut self, pkid: u16) {
        if pkid == 0 {
            return;
        }
        if let Some(token) = self.awaiting_pkid.pop_front() {
            self.in_flight.insert(pkid, token);
        }
    }

    async fn acknowledge(&mut self, pkid: u16) -> Option<DeliveryToken> {
        let token = self.in_flight.remove(&pkid)?;
        self.store.remove(token).await;
        Some(DeliveryToken(token))
    }

    async fn forget(&mut self, token: DeliveryToken) {
        self.awaiting_pkid.retain(|t| *t != token.0);
        self.store.remove(token.0).await;
    }
}

pub struct RumqttBroker {
    settings: BrokerSettings,
    client: Option<AsyncClient>,
    poll_task: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    outbox: Arc<Mutex<Outbox>>,
}

impl RumqttBroker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            client: None,
            poll_task: None,
            connected: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
            outbox: Arc::new(Mutex::new(Outbox::new(SessionStore::memory()))),
        }
    }

    fn options(&self, request: &ConnectRequest) -> MqttOptions {
        let mut options =
            MqttOptions::new(request.client_id.clone(), request.host.clone(), request.port);
        options
            .set_clean_session(request.clean_session)
            .set_keep_alive(self.settings.keep_alive);
        if let Some((user, password)) = &request.credentials {
            options.set_credentials(user.clone(), password.clone());
        }
        options
    }

    /// Drops whatever session is left without talking to the broker.
    fn teardown(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.client = None;
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }

    /// Publishes records a previous session never got acknowledged. They keep their ids
    /// and stay on disk until the broker acknowledges them this time.
    async fn replay(&self, client: &AsyncClient, records: Vec<(u64, OutboundRecord)>) {
        info!("Replaying {} unacknowledged messages", records.len());
        for (id, record) in records {
            self.outbox.lock().await.awaiting_pkid.push_back(id);
            if let Err(e) = client
                .publish(record.topic.as_str(), record.qos.into(), false, record.payload)
                .await
            {
                warn!("Could not replay message {} to {}: {}", id, record.topic, e);
                self.outbox.lock().await.awaiting_pkid.retain(|t| *t != id);
            }
        }
    }

    fn live_client(&self) -> Result<&AsyncClient, BrokerError> {
        match &self.client {
            Some(client) if self.is_connected() => Ok(client),
            _ => Err(BrokerError::NotConnected),
        }
    }
}

impl Drop for RumqttBroker {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Polls until CONNACK. Anything other than a successful CONNACK is an error.
async fn await_connack(event_loop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                let reason = format!("{:?}", ack.code);
                return Err(BrokerError::Rejected {
                    code: ack.code as i32,
                    reason,
                });
            }
            Ok(event) => debug!("Event before CONNACK: {:?}", event),
            Err(e) => return Err(e.into()),
        }
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    callback: BrokerCallback,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    outbox: Arc<Mutex<Outbox>>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Message arrived on {}", publish.topic);
                callback(BrokerEvent::MessageArrived(MqttMessage::from_publish(&publish)));
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                if let Some(token) = outbox.lock().await.acknowledge(ack.pkid).await {
                    callback(BrokerEvent::DeliveryComplete(token));
                }
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                if let Some(token) = outbox.lock().await.acknowledge(comp.pkid).await {
                    callback(BrokerEvent::DeliveryComplete(token));
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                outbox.lock().await.assign(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent, event loop finished");
                connected.store(false, Ordering::SeqCst);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                if closing.load(Ordering::SeqCst) {
                    debug!("Event loop closed during disconnect: {}", e);
                } else {
                    warn!("Connection lost: {}", e);
                    callback(BrokerEvent::ConnectionLost(e.to_string()));
                }
                break;
            }
        }
    }
}

#[async_trait::async_trait]
impl BrokerClient for RumqttBroker {
    async fn connect(
        &mut self,
        request: ConnectRequest,
        callback: BrokerCallback,
    ) -> Result<(), BrokerError> {
        self.teardown();

        info!("Connecting to {} as {}", request.url, request.client_id);
        let options = self.options(&request);
        let clean_session = request.clean_session;
        let mut storage =
            SessionStore::open(request.session_dir.as_deref(), &request.client_id).await;
        if clean_session {
            storage.clear().await;
        }
        let leftovers = storage.records();

        let (client, mut event_loop) = AsyncClient::new(options, self.settings.channel_capacity);
        await_connack(&mut event_loop).await?;

        info!(
            "Connected to {} ({} session store)",
            request.url,
            if storage.is_durable() { "durable" } else { "in-memory" }
        );

        *self.outbox.lock().await = Outbox::new(storage);
        self.closing.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);

        self.poll_task = Some(tokio::spawn(drive_event_loop(
            event_loop,
            callback,
            self.connected.clone(),
            self.closing.clone(),
            self.outbox.clone(),
        )));
        if !leftovers.is_empty() {
            self.replay(&client, leftovers).await;
        }
        self.client = Some(client);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), BrokerError> {
        let client = self.live_client()?;
        client.subscribe(topic, qos.into()).await?;
        info!("Subscribed to {} (QoS {})", topic, qos.level());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let client = self.live_client()?;
        client.unsubscribe(topic).await?;
        info!("Unsubscribed from {}", topic);
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<DeliveryToken, BrokerError> {
        let client = self.live_client()?;

        let token = {
            let mut outbox = self.outbox.lock().await;
            outbox.store.check().await?;
            let token = outbox.next_token();
            if qos != Qos::AtMostOnce {
                let record = OutboundRecord {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    qos,
                };
                outbox.store.store(token.0, &record).await?;
                outbox.awaiting_pkid.push_back(token.0);
            }
            token
        };

        if let Err(e) = client.publish(topic, qos.into(), retain, payload).await {
            self.outbox.lock().await.forget(token).await;
            return Err(e.into());
        }

        debug!("Published {} to {} (QoS {})", token, topic, qos.level());
        Ok(token)
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        let Some(client) = self.client.take() else {
            return Err(BrokerError::NotConnected);
        };

        self.closing.store(true, Ordering::SeqCst);
        let result = client.disconnect().await.map_err(BrokerError::from);

        if let Some(mut task) = self.poll_task.take() {
            if tokio::time::timeout(self.settings.disconnect_grace, &mut task)
                .await
                .is_err()
            {
                warn!("Event loop did not finish within grace period, aborting");
                task.abort();
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        info!("Disconnected");
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
