//! # State Portal - Durable Key/Value Store
//!
//! Implements the production `StateStore`: a flat map of typed values that is shared
//! between the lifecycle controller and the startup code, and written to a TOML file
//! so it survives the process being killed.
//!
//! ## Layout
//!
//! ```text
//! Controller ──set()──► StatePortal (RwLock<BTreeMap>) ──Flush──► PersistenceWorker ──► state.toml
//!            ◄─get()──                                 ◄─Sync (oneshot ack)──
//! ```
//!
//! Reads and writes never touch the disk on the caller's thread. A write updates the map
//! under the lock and hands a snapshot to the worker, so a crash after `set` returns can
//! lose at most the snapshots still queued in the worker.
//!
//! ## Lock Contention Handling
//!
//! Access goes through the `try_lock!` macro: 5 attempts, 10ms apart, then
//! `PersistenceError::LockTimeout`. The controller is the only writer in practice, so
//! contention only shows up while the startup code or tests read concurrently.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::persistence_worker::{PersistAction, PersistenceWorker};
use super::{PersistenceError, StateStore, StoredValue};

type StateMap = BTreeMap<String, StoredValue>;

/// Lock retry macro with a bounded number of attempts.
///
/// `@write_lock_retry` hands the guarded value to the operation mutably,
/// `@read_lock_retry` immutably. Both evaluate to
/// `Result<operation output, PersistenceError>`.
macro_rules! try_lock {
    (@write_lock_retry, $accessor:expr, $operation:expr) => {{
        let mut attempts = 0;
        const MAX_ATTEMPTS: usize = 5;

        loop {
            match $accessor.try_write() {
                Ok(mut guard) => {
                    break Ok($operation(&mut *guard));
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(
                        "Write lock blocked: {} (attempt {}/{})",
                        e,
                        attempts,
                        MAX_ATTEMPTS
                    );

                    if attempts >= MAX_ATTEMPTS {
                        break Err(PersistenceError::LockTimeout);
                    }

                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }
    }};

    (@read_lock_retry, $accessor:expr, $operation:expr) => {{
        let mut attempts = 0;
        const MAX_ATTEMPTS: usize = 5;

        loop {
            match $accessor.try_read() {
                Ok(guard) => {
                    break Ok($operation(&*guard));
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(
                        "Read lock blocked: {} (attempt {}/{})",
                        e,
                        attempts,
                        MAX_ATTEMPTS
                    );

                    if attempts >= MAX_ATTEMPTS {
                        break Err(PersistenceError::LockTimeout);
                    }

                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }
    }};
}

/// Durable typed key/value store backed by a TOML file.
///
/// Cloning is cheap and every clone shares the same values and the same flush worker.
#[derive(Clone, Debug)]
pub struct StatePortal {
    values: Arc<RwLock<StateMap>>,
    flush_tx: Option<mpsc::UnboundedSender<PersistAction>>,
}

impl StatePortal {
    /// A store that is never written to disk.
    ///
    /// Used when the state file cannot be opened and in tests.
    pub fn in_memory() -> Self {
        Self {
            values: Arc::new(RwLock::new(StateMap::new())),
            flush_tx: None,
        }
    }

    /// Loads the state file (if present) and starts the flush worker.
    ///
    /// A missing file is not an error: the store starts empty and the file is created on
    /// the first write. A file that exists but does not parse is reported, since silently
    /// discarding it would also discard the user's `isStarted` intent.
    pub async fn open(path: impl AsRef<Path>) -> Result<(Self, JoinHandle<()>), PersistenceError> {
        let path = path.as_ref().to_path_buf();

        let values: StateMap = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            let values = toml::from_str(&content)?;
            info!("Loaded durable state from {}", path.display());
            values
        } else {
            info!(
                "No state file at {}, starting with empty state",
                path.display()
            );
            StateMap::new()
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (flush_tx, worker_handle) = PersistenceWorker::spawn(path);

        Ok((
            Self {
                values: Arc::new(RwLock::new(values)),
                flush_tx: Some(flush_tx),
            },
            worker_handle,
        ))
    }

    pub fn is_durable(&self) -> bool {
        self.flush_tx.is_some()
    }

    /// Waits until every write issued so far has reached the disk.
    pub async fn sync(&self) -> Result<(), PersistenceError> {
        let Some(flush_tx) = &self.flush_tx else {
            return Ok(());
        };

        let (response_tx, response_rx) = oneshot::channel();
        flush_tx
            .send(PersistAction::Sync { response_tx })
            .map_err(|_| PersistenceError::WorkerGone)?;
        response_rx.await.map_err(|_| PersistenceError::WorkerGone)?
    }

    /// Copy of every stored value, mostly for diagnostics.
    pub fn snapshot(&self) -> Result<BTreeMap<String, StoredValue>, PersistenceError> {
        try_lock!(@read_lock_retry, self.values, |guard: &StateMap| guard.clone())
    }
}

impl StateStore for StatePortal {
    fn get(&self, key: &str) -> Result<Option<StoredValue>, PersistenceError> {
        try_lock!(@read_lock_retry, self.values, |guard: &StateMap| {
            guard.get(key).cloned()
        })
    }

    fn set(&self, key: &str, value: StoredValue) -> Result<(), PersistenceError> {
        debug!("Persisting {} = {}", key, value);

        let snapshot = try_lock!(@write_lock_retry, self.values, |guard: &mut StateMap| {
            guard.insert(key.to_string(), value);
            guard.clone()
        })?;

        if let Some(flush_tx) = &self.flush_tx {
            if flush_tx.send(PersistAction::Flush { snapshot }).is_err() {
                warn!("Persistence worker gone, {} kept in memory only", key);
                return Err(PersistenceError::WorkerGone);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::keys;

    #[tokio::test]
    async fn open_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.toml");

        let (portal, _worker) = StatePortal::open(&path).await.unwrap();
        assert!(portal.is_durable());
        assert!(portal.snapshot().unwrap().is_empty());
        assert!(path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");

        {
            let (portal, _worker) = StatePortal::open(&path).await.unwrap();
            portal.set_bool(keys::STARTED, true).unwrap();
            portal.set_i64(keys::RETRY_INTERVAL_MS, 40_000).unwrap();
            portal.set_string(keys::SERVER, "broker.example.com").unwrap();
            portal.sync().await.unwrap();
        }

        let (reopened, _worker) = StatePortal::open(&path).await.unwrap();
        assert!(reopened.get_bool(keys::STARTED, false).unwrap());
        assert_eq!(reopened.get_i64(keys::RETRY_INTERVAL_MS, 0).unwrap(), 40_000);
        assert_eq!(
            reopened.get_string(keys::SERVER).unwrap().as_deref(),
            Some("broker.example.com")
        );
    }

    #[tokio::test]
    async fn corrupt_state_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");
        tokio::fs::write(&path, "isStarted = [unterminated").await.unwrap();

        let result = StatePortal::open(&path).await;
        assert!(matches!(result, Err(PersistenceError::Deserialize(_))));
    }

    #[test]
    fn in_memory_store_keeps_values() {
        let portal = StatePortal::in_memory();
        assert!(!portal.is_durable());

        portal.set_i64(keys::PORT, 8883).unwrap();
        let clone = portal.clone();
        assert_eq!(clone.get_i64(keys::PORT, 1883).unwrap(), 8883);
    }
}
