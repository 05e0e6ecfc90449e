use serde::{Deserialize, Serialize};

use crate::persistence::{keys, PersistenceError, StateStore};

/// Broker connection settings supplied by the user.
///
/// Written by the configuration flow and read back at every connect attempt. Once a
/// connect has been requested the stored copy is treated as immutable until the user
/// configures again from Idle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub server: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: Option<String>,
    pub clean_session: bool,
}

impl ConnectionConfig {
    pub const DEFAULT_PORT: u16 = 1883;

    pub fn new(server: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            port: Self::DEFAULT_PORT,
            client_id: client_id.into(),
            username: None,
            password: None,
            topic: None,
            clean_session: true,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    /// `tcp://{server}:{port}`
    pub fn broker_url(&self) -> String {
        format!("tcp://{}:{}", self.server, self.port)
    }

    /// `{server}:{port}`, what the reachability probe connects to.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    /// Reads the configuration from the durable store.
    ///
    /// `server` and `clientID` are required. Empty username, password and topic strings
    /// are read as absent, the way the configuration form stores them.
    pub fn load(store: &dyn StateStore) -> Result<Self, PersistenceError> {
        let server = non_empty(store.get_string(keys::SERVER)?)
            .ok_or(PersistenceError::MissingKey(keys::SERVER))?;
        let client_id = non_empty(store.get_string(keys::CLIENT_ID)?)
            .ok_or(PersistenceError::MissingKey(keys::CLIENT_ID))?;

        let port = store.get_i64(keys::PORT, i64::from(Self::DEFAULT_PORT))?;
        let port = u16::try_from(port).map_err(|_| PersistenceError::InvalidValue {
            key: keys::PORT,
            reason: format!("{} is not a valid port", port),
        })?;

        Ok(Self {
            server,
            port,
            client_id,
            username: non_empty(store.get_string(keys::USERNAME)?),
            password: non_empty(store.get_string(keys::PASSWORD)?),
            topic: non_empty(store.get_string(keys::TOPIC)?),
            clean_session: store.get_bool(keys::CLEAN_SESSION, true)?,
        })
    }

    pub fn save(&self, store: &dyn StateStore) -> Result<(), PersistenceError> {
        store.set_string(keys::SERVER, &self.server)?;
        store.set_i64(keys::PORT, i64::from(self.port))?;
        store.set_string(keys::CLIENT_ID, &self.client_id)?;
        store.set_string(keys::USERNAME, self.username.as_deref().unwrap_or(""))?;
        store.set_string(keys::PASSWORD, self.password.as_deref().unwrap_or(""))?;
        store.set_string(keys::TOPIC, self.topic.as_deref().unwrap_or(""))?;
        store.set_bool(keys::CLEAN_SESSION, self.clean_session)?;
        Ok(())
    }

    /// Username/password pair, only when a username is set.
    pub fn credentials(&self) -> Option<(String, String)> {
        self.username.as_ref().map(|user| {
            (user.clone(), self.password.clone().unwrap_or_default())
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}
