//! # Persistence Module
//!
//! ## Why This Module Exists
//! The connection keeper has to survive its own process being killed. Everything the
//! lifecycle controller needs to rebuild itself after a restart (the user's intent to be
//! connected, the last backoff delay, and the broker configuration) lives in a small typed
//! key/value store defined here.
//!
//! ## Key Abstractions
//! - **`StateStore`**: the seam the controller talks to. Typed getters/setters on top of
//!   two primitive operations so alternative backends stay trivial to write.
//! - **`StatePortal`**: the production store. Values live in memory behind a lock and are
//!   flushed to a TOML file by a background worker.
//! - **`LifecycleState`**: the durable lifecycle flags read at every controller entry point.
//!
//! ## Error Handling Strategy
//! Store failures never take the controller down. Callers log `PersistenceError`s and keep
//! going with the in-memory value, which stays authoritative for the rest of the process.

pub mod persistence_worker;
pub mod state_portal;

pub use state_portal::StatePortal;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::controller::backoff::INITIAL_RETRY_INTERVAL;

/// Keys written to the durable store.
pub mod keys {
    pub const STARTED: &str = "isStarted";
    pub const CLIENT_ID: &str = "clientID";
    pub const SERVER: &str = "server";
    pub const PORT: &str = "port";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const TOPIC: &str = "topic";
    pub const CLEAN_SESSION: &str = "cleanSession";
    pub const RETRY_INTERVAL_MS: &str = "retryIntervalMs";
}

/// A single typed value in the durable store.
///
/// Untagged so the state file reads like plain TOML (`isStarted = true`).
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum StoredValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl StoredValue {
    pub fn kind(&self) -> &'static str {
        match self {
            StoredValue::Bool(_) => "bool",
            StoredValue::Int(_) => "int",
            StoredValue::Text(_) => "string",
        }
    }
}

impl fmt::Display for StoredValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoredValue::Bool(b) => write!(f, "{}", b),
            StoredValue::Int(i) => write!(f, "{}", i),
            StoredValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

/// Error types for durable state operations.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Could not acquire state lock after maximum retry attempts")]
    LockTimeout,

    #[error("Missing required key: {0}")]
    MissingKey(&'static str),

    #[error("Key {key} holds a {found}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("State file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to parse state file: {0}")]
    Deserialize(#[from] toml::de::Error),

    #[error("Persistence worker is no longer running")]
    WorkerGone,
}

/// Typed key/value persistence that survives process restarts.
///
/// Implementors only provide `get` and `set`; the typed accessors are derived from them.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<StoredValue>, PersistenceError>;

    fn set(&self, key: &str, value: StoredValue) -> Result<(), PersistenceError>;

    fn get_bool(&self, key: &str, default: bool) -> Result<bool, PersistenceError> {
        match self.get(key)? {
            None => Ok(default),
            Some(StoredValue::Bool(b)) => Ok(b),
            Some(other) => Err(mismatch(key, "bool", &other)),
        }
    }

    fn get_i64(&self, key: &str, default: i64) -> Result<i64, PersistenceError> {
        match self.get(key)? {
            None => Ok(default),
            Some(StoredValue::Int(i)) => Ok(i),
            Some(other) => Err(mismatch(key, "int", &other)),
        }
    }

    fn get_string(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        match self.get(key)? {
            None => Ok(None),
            Some(StoredValue::Text(s)) => Ok(Some(s)),
            Some(other) => Err(mismatch(key, "string", &other)),
        }
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), PersistenceError> {
        self.set(key, StoredValue::Bool(value))
    }

    fn set_i64(&self, key: &str, value: i64) -> Result<(), PersistenceError> {
        self.set(key, StoredValue::Int(value))
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.set(key, StoredValue::Text(value.to_string()))
    }
}

fn mismatch(key: &str, expected: &'static str, found: &StoredValue) -> PersistenceError {
    PersistenceError::TypeMismatch {
        key: key.to_string(),
        expected,
        found: found.kind(),
    }
}

/// Durable lifecycle flags.
///
/// `started` is the user's declared intent and the single source of truth for whether a
/// connection should exist. `retry_interval` is the last backoff delay handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LifecycleState {
    pub started: bool,
    pub retry_interval: Duration,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self {
            started: false,
            retry_interval: INITIAL_RETRY_INTERVAL,
        }
    }
}

impl LifecycleState {
    pub fn load(store: &dyn StateStore) -> Result<Self, PersistenceError> {
        Ok(Self {
            started: Self::was_started(store)?,
            retry_interval: Self::last_retry_interval(store)?,
        })
    }

    pub fn was_started(store: &dyn StateStore) -> Result<bool, PersistenceError> {
        store.get_bool(keys::STARTED, false)
    }

    pub fn set_started(store: &dyn StateStore, started: bool) -> Result<(), PersistenceError> {
        store.set_bool(keys::STARTED, started)
    }

    /// Last persisted retry delay. Missing or non-positive values read as the initial delay.
    pub fn last_retry_interval(store: &dyn StateStore) -> Result<Duration, PersistenceError> {
        let initial = INITIAL_RETRY_INTERVAL.as_millis() as i64;
        let ms = store.get_i64(keys::RETRY_INTERVAL_MS, initial)?;
        if ms <= 0 {
            return Ok(INITIAL_RETRY_INTERVAL);
        }
        Ok(Duration::from_millis(ms as u64))
    }

    pub fn set_retry_interval(
        store: &dyn StateStore,
        interval: Duration,
    ) -> Result<(), PersistenceError> {
        let ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
        store.set_i64(keys::RETRY_INTERVAL_MS, ms)
    }
}
