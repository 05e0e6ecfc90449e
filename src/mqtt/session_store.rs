//! Local store for outbound messages that are still waiting for broker acknowledgement.
//!
//! A durable store keeps one `{id}.msg` file per in-flight message under a per-client
//! directory. Opening the store loads whatever an earlier process left there, so those
//! records can be published again on a resumed session or dropped on a clean one.
//! When the directory cannot be created the store falls back to memory for the rest of
//! the session.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::client::Qos;
use super::error::BrokerError;

const RECORD_EXTENSION: &str = "msg";

/// An outbound publish recorded until the broker acknowledges it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

impl OutboundRecord {
    /// `qos | topic length (u16 BE) | topic | payload`
    fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.topic.len() + self.payload.len() + 3);
        bytes.push(self.qos.level());
        bytes.extend_from_slice(&(self.topic.len() as u16).to_be_bytes());
        bytes.extend_from_slice(self.topic.as_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let (&level, rest) = bytes.split_first()?;
        let qos = Qos::from_level(level)?;
        let len_bytes: [u8; 2] = rest.get(..2)?.try_into().ok()?;
        let topic_len = u16::from_be_bytes(len_bytes) as usize;
        let topic = rest.get(2..2 + topic_len)?;
        let topic = String::from_utf8(topic.to_vec()).ok()?;
        Some(Self {
            topic,
            payload: rest[2 + topic_len..].to_vec(),
            qos,
        })
    }
}

#[derive(Debug)]
pub struct SessionStore {
    /// `None` for the in-memory store.
    dir: Option<PathBuf>,
    pending: BTreeMap<u64, OutboundRecord>,
}

impl SessionStore {
    pub fn memory() -> Self {
        Self {
            dir: None,
            pending: BTreeMap::new(),
        }
    }

    /// Opens the durable store for `client_id` under `base`, or falls back to memory.
    pub async fn open(base: Option<&Path>, client_id: &str) -> Self {
        let Some(base) = base else {
            debug!("No session directory configured, using in-memory session store");
            return Self::memory();
        };

        let dir = base.join(sanitize(client_id));
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(
                "Could not open session store at {} ({}), falling back to memory",
                dir.display(),
                e
            );
            return Self::memory();
        }

        let pending = match load_records(&dir).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Could not read {}: {}", dir.display(), e);
                BTreeMap::new()
            }
        };
        info!(
            "Using durable session store at {} ({} unacknowledged)",
            dir.display(),
            pending.len()
        );
        Self {
            dir: Some(dir),
            pending,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.dir.is_some()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Highest record id in the store, 0 when empty.
    pub fn last_id(&self) -> u64 {
        self.pending.keys().next_back().copied().unwrap_or(0)
    }

    /// Every unacknowledged record, oldest first.
    pub fn records(&self) -> Vec<(u64, OutboundRecord)> {
        self.pending
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect()
    }

    /// Verifies the backing storage is still usable.
    pub async fn check(&self) -> Result<(), BrokerError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        match tokio::fs::metadata(dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(BrokerError::Persistence(format!(
                "session directory {} is gone",
                dir.display()
            ))),
        }
    }

    pub async fn store(&mut self, id: u64, record: &OutboundRecord) -> Result<(), BrokerError> {
        if let Some(dir) = &self.dir {
            let path = record_path(dir, id);
            tokio::fs::write(&path, record.encode()).await.map_err(|e| {
                BrokerError::Persistence(format!("failed to write {}: {}", path.display(), e))
            })?;
        }
        self.pending.insert(id, record.clone());
        Ok(())
    }

    pub async fn remove(&mut self, id: u64) {
        if self.pending.remove(&id).is_none() {
            return;
        }
        if let Some(dir) = &self.dir {
            let path = record_path(dir, id);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    /// Drops every record, including those loaded from an earlier process. Used when a
    /// clean session is started.
    pub async fn clear(&mut self) {
        let ids: Vec<u64> = self.pending.keys().copied().collect();
        if !ids.is_empty() {
            debug!("Clearing {} unacknowledged records", ids.len());
        }
        for id in ids {
            self.remove(id).await;
        }
    }
}

fn record_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}.{}", id, RECORD_EXTENSION))
}

/// Reads every `{id}.msg` file in `dir`. Files that do not decode are deleted.
async fn load_records(dir: &Path) -> std::io::Result<BTreeMap<u64, OutboundRecord>> {
    let mut pending = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
            continue;
        }
        let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        else {
            debug!("Skipping {}", path.display());
            continue;
        };

        match OutboundRecord::decode(&tokio::fs::read(&path).await?) {
            Some(record) => {
                pending.insert(id, record);
            }
            None => {
                warn!("Discarding unreadable record {}", path.display());
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }
    Ok(pending)
}

fn sanitize(client_id: &str) -> String {
    client_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
