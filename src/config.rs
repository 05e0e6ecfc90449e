//! Application configuration.
//!
//! Process-level settings only: where state lives, how reachability is probed and the
//! network timeouts. Broker connection settings are user data and live in the durable
//! state store instead (see [`crate::mqtt::ConnectionConfig`]).

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::controller::ControllerSettings;
use crate::mqtt::BrokerSettings;
use crate::platform::ProbeSettings;

const CONFIG_DIR: &str = ".config/pushlink";
const CONFIG_FILE: &str = "pushlink.toml";
const STATE_FILE: &str = "state.toml";
const SESSION_DIR: &str = "sessions";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub state_file: PathBuf,
    /// Durable MQTT session stores. Unset keeps sessions in memory.
    pub session_dir: Option<PathBuf>,
    /// `host:port` probed for reachability. Unset probes the configured broker and follows
    /// it when the connection settings change.
    pub probe_address: Option<String>,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub mqtt_keep_alive_secs: u64,
    pub event_capacity: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let base = config_dir();
        Self {
            state_file: base.join(STATE_FILE),
            session_dir: Some(base.join(SESSION_DIR)),
            probe_address: None,
            probe_interval_secs: 15,
            probe_timeout_secs: 3,
            connect_timeout_secs: 30,
            mqtt_keep_alive_secs: 60,
            event_capacity: 100,
            shutdown_grace_secs: 5,
        }
    }
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        config_dir().join(CONFIG_FILE)
    }

    /// Loads the config at `path`, writing the defaults there first if it does not exist.
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            info!("Creating default configuration at {}", path.display());
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
        let config: Self =
            toml::from_str(&text).map_err(|e| eyre!("Failed to parse {}: {}", path.display(), e))?;
        debug!("Loaded configuration: {:?}", config);
        Ok(config.validated())
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let text =
            toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, text)
            .await
            .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
        Ok(())
    }

    /// Replaces zero durations and capacities with defaults.
    fn validated(mut self) -> Self {
        let defaults = Self::default();
        if self.probe_interval_secs == 0 {
            warn!("probe_interval_secs must be positive, using default");
            self.probe_interval_secs = defaults.probe_interval_secs;
        }
        if self.probe_timeout_secs == 0 {
            warn!("probe_timeout_secs must be positive, using default");
            self.probe_timeout_secs = defaults.probe_timeout_secs;
        }
        if self.connect_timeout_secs == 0 {
            warn!("connect_timeout_secs must be positive, using default");
            self.connect_timeout_secs = defaults.connect_timeout_secs;
        }
        if self.event_capacity == 0 {
            warn!("event_capacity must be positive, using default");
            self.event_capacity = defaults.event_capacity;
        }
        self
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            session_dir: self.session_dir.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ..ControllerSettings::default()
        }
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            keep_alive: Duration::from_secs(self.mqtt_keep_alive_secs),
            channel_capacity: self.event_capacity,
            ..BrokerSettings::default()
        }
    }

    /// Probe settings, aimed at `fallback` when no explicit probe address is configured.
    pub fn probe_settings(&self, fallback: &str) -> ProbeSettings {
        ProbeSettings {
            address: self
                .probe_address
                .clone()
                .unwrap_or_else(|| fallback.to_string()),
            interval: Duration::from_secs(self.probe_interval_secs),
            timeout: Duration::from_secs(self.probe_timeout_secs),
            follow_broker: self.probe_address.is_none(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn config_dir() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = AppConfig::load_or_create(&path).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        let again = AppConfig::load_or_create(&path).await.unwrap();
        assert_eq!(again, config);
    }

    #[tokio::test]
    async fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "connect_timeout_secs = 5\nprobe_interval_secs = 0\n")
            .await
            .unwrap();

        let config = AppConfig::load_or_create(&path).await.unwrap();
        assert_eq!(config.connect_timeout_secs, 5);
        assert_eq!(config.probe_interval_secs, 15);
        assert_eq!(config.controller_settings().connect_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "connect_timeout_secs = \"soon\"").await.unwrap();

        assert!(AppConfig::load_or_create(&path).await.is_err());
    }

    #[test]
    fn probe_falls_back_to_broker_address() {
        let config = AppConfig::default();
        let settings = config.probe_settings("broker:1883");
        assert_eq!(settings.address, "broker:1883");
        assert!(settings.follow_broker);

        let config = AppConfig {
            probe_address: Some("1.1.1.1:53".into()),
            ..AppConfig::default()
        };
        let settings = config.probe_settings("broker:1883");
        assert_eq!(settings.address, "1.1.1.1:53");
        assert!(!settings.follow_broker);
    }
}
