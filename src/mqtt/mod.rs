//! # MQTT Integration Module
//!
//! Everything that talks MQTT. The lifecycle controller never touches rumqttc directly;
//! it only sees the [`client::BrokerClient`] trait, the error taxonomy and the connection
//! config.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── client.rs           - BrokerClient seam, QoS, events and connect request
//! ├── config.rs           - ConnectionConfig stored in the durable state
//! ├── error.rs            - BrokerError and the numeric result codes
//! ├── message_manager.rs  - Incoming message representation
//! ├── mqtt_handler.rs     - rumqttc implementation (RumqttBroker)
//! └── session_store.rs    - On-disk store for unacknowledged outbound messages
//! ```
//!
//! ## Session Storage
//!
//! Every connect opens a [`session_store::SessionStore`] on the network worker. The
//! durable variant lives under the configured session directory, one subdirectory per
//! client id. Records left there by an earlier process are dropped on a clean session
//! and published again on a resumed one. If the directory cannot be created the connect
//! proceeds with an in-memory store instead.

pub mod client;
pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod session_store;

pub use client::{BrokerCallback, BrokerClient, BrokerEvent, ConnectRequest, DeliveryToken, Qos};
pub use config::ConnectionConfig;
pub use error::BrokerError;
pub use message_manager::MqttMessage;
pub use mqtt_handler::{BrokerSettings, RumqttBroker};
pub use session_store::SessionStore;
