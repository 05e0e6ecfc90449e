use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{PersistenceError, StoredValue};

macro_rules! handle_action {
    ($action:expr, $response_tx:expr) => {
        if let Err(_) = $response_tx.send($action.await) {
            error!("Failed to send response");
        }
    };
}

// Aktion-Enum für den Persistence-Worker
#[derive(Debug)]
pub enum PersistAction {
    Flush {
        snapshot: BTreeMap<String, StoredValue>,
    },
    Sync {
        response_tx: oneshot::Sender<Result<(), PersistenceError>>,
    },
}

/// Writes state snapshots to disk off the caller's thread.
///
/// Snapshots queued back to back are coalesced: only the newest one is written.
pub struct PersistenceWorker {
    path: PathBuf,
    rx: UnboundedReceiver<PersistAction>,
    last_result: Result<(), String>,
}

impl PersistenceWorker {
    pub fn spawn(path: PathBuf) -> (UnboundedSender<PersistAction>, JoinHandle<()>) {
        let (tx, rx) = unbounded_channel::<PersistAction>();
        let worker = Self {
            path,
            rx,
            last_result: Ok(()),
        };
        let handle = tokio::spawn(worker.run());
        (tx, handle)
    }

    async fn run(mut self) {
        debug!("Persistence worker started for {}", self.path.display());

        while let Some(action) = self.rx.recv().await {
            match action {
                PersistAction::Flush { mut snapshot } => {
                    let mut pending_sync = Vec::new();
                    // Coalesce whatever else is already queued.
                    while let Ok(next) = self.rx.try_recv() {
                        match next {
                            PersistAction::Flush { snapshot: newer } => snapshot = newer,
                            PersistAction::Sync { response_tx } => pending_sync.push(response_tx),
                        }
                    }

                    let result = self.write_snapshot(&snapshot).await;
                    if let Err(e) = &result {
                        error!("Failed to write state file {}: {}", self.path.display(), e);
                    }
                    self.last_result = result.map_err(|e| e.to_string());

                    for response_tx in pending_sync {
                        handle_action!(self.report(), response_tx);
                    }
                }
                PersistAction::Sync { response_tx } => {
                    handle_action!(self.report(), response_tx);
                }
            }
        }

        info!("Persistence worker for {} stopped", self.path.display());
    }

    async fn report(&self) -> Result<(), PersistenceError> {
        self.last_result.clone().map_err(|e| {
            PersistenceError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })
    }

    async fn write_snapshot(
        &self,
        snapshot: &BTreeMap<String, StoredValue>,
    ) -> Result<(), PersistenceError> {
        let content = toml::to_string_pretty(snapshot)?;

        let mut tmp_path = self.path.clone();
        tmp_path.set_extension("toml.tmp");

        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        debug!(
            "State file {} written ({} keys)",
            self.path.display(),
            snapshot.len()
        );
        Ok(())
    }
}
