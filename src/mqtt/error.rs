//! Error taxonomy for the broker client seam.
//!
//! The lifecycle controller only cares about three questions when a network call fails:
//! should the link be considered dead (`NotConnected`), is the local session store broken
//! (`Persistence`), or is it anything else (retried through backoff). The numeric code is
//! what the result listener receives alongside the message.

use std::time::Duration;
use thiserror::Error;

/// Numeric status codes reported to the result listener.
pub mod codes {
    pub const CLIENT: i32 = 0;
    pub const TIMEOUT: i32 = 32000;
    pub const DISCONNECTING: i32 = 32102;
    pub const SERVER_CONNECT: i32 = 32103;
    pub const NOT_CONNECTED: i32 = 32104;
    pub const CONNECTION_LOST: i32 = 32109;
    pub const PERSISTENCE: i32 = 32200;
    pub const CONFIG: i32 = -1;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Connect refused, socket error, DNS failure.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The client has no live connection for the requested operation.
    #[error("Client is not connected")]
    NotConnected,

    /// The local session store could not be written.
    #[error("Session persistence failed: {0}")]
    Persistence(String),

    /// CONNACK with a non-success return code (bad credentials, bad client id, ...).
    #[error("Broker rejected connection (code {code}): {reason}")]
    Rejected { code: i32, reason: String },

    /// The request could not be handed to the client.
    #[error("Client request failed: {0}")]
    Client(String),

    #[error("Invalid connection config: {0}")]
    Config(String),
}

impl BrokerError {
    pub fn code(&self) -> i32 {
        match self {
            BrokerError::Network(_) => codes::SERVER_CONNECT,
            BrokerError::Timeout(_) => codes::TIMEOUT,
            BrokerError::ConnectionLost(_) => codes::CONNECTION_LOST,
            BrokerError::NotConnected => codes::NOT_CONNECTED,
            BrokerError::Persistence(_) => codes::PERSISTENCE,
            BrokerError::Rejected { code, .. } => *code,
            BrokerError::Client(_) => codes::CLIENT,
            BrokerError::Config(_) => codes::CONFIG,
        }
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self, BrokerError::NotConnected)
    }

    pub fn is_persistence(&self) -> bool {
        matches!(self, BrokerError::Persistence(_))
    }
}

impl From<rumqttc::ClientError> for BrokerError {
    fn from(e: rumqttc::ClientError) -> Self {
        BrokerError::Client(e.to_string())
    }
}

impl From<rumqttc::ConnectionError> for BrokerError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        match e {
            rumqttc::ConnectionError::ConnectionRefused(code) => {
                let reason = format!("{:?}", code);
                BrokerError::Rejected {
                    code: code as i32,
                    reason,
                }
            }
            other => BrokerError::Network(other.to_string()),
        }
    }
}
