//! The broker client seam.
//!
//! Everything the lifecycle controller needs from an MQTT client, expressed as one
//! object-safe trait. The production implementation is [`RumqttBroker`]; tests plug in
//! scripted fakes.
//!
//! [`RumqttBroker`]: super::mqtt_handler::RumqttBroker

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::error::BrokerError;
use super::message_manager::MqttMessage;

/// Delivery-guarantee tier for a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn level(&self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for Qos {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => Qos::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => Qos::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => Qos::ExactlyOnce,
        }
    }
}

/// Handle for a published message, completed by [`BrokerEvent::DeliveryComplete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryToken(pub u64);

impl fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Asynchronous notifications raised by a connected client.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    ConnectionLost(String),
    MessageArrived(MqttMessage),
    DeliveryComplete(DeliveryToken),
}

/// Callback registered with the client at connect time.
pub type BrokerCallback = Arc<dyn Fn(BrokerEvent) + Send + Sync>;

/// Everything needed to open one session.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: String,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub clean_session: bool,
    /// Base directory for the durable session store. `None` keeps the session in memory.
    pub session_dir: Option<PathBuf>,
}

impl ConnectRequest {
    pub fn from_config(
        config: &super::config::ConnectionConfig,
        session_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            url: config.broker_url(),
            host: config.server.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
            credentials: config.credentials(),
            clean_session: config.clean_session,
            session_dir,
        }
    }
}

/// Minimal MQTT client capability used by the lifecycle controller.
///
/// Calls are issued from a single network worker, one at a time, so implementations
/// need no internal request serialization. `connect` replaces any previous session.
#[async_trait::async_trait]
pub trait BrokerClient: Send + 'static {
    async fn connect(
        &mut self,
        request: ConnectRequest,
        callback: BrokerCallback,
    ) -> Result<(), BrokerError>;

    async fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), BrokerError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<DeliveryToken, BrokerError>;

    async fn disconnect(&mut self) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;
}
