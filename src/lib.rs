//! pushlink keeps one long-lived MQTT connection alive on a host that sleeps, loses
//! network and can have its process killed at any time.

pub mod config;
pub mod console;
pub mod controller;
pub mod mqtt;
pub mod persistence;
pub mod platform;
