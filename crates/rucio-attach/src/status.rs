//! Per-notebook, per-DID resolution status.
//!
//! The registry is the only user-visible failure surface: the UI reads the
//! current [`ResolveStatus`] for a `(notebook, did)` pair and subscribes to
//! [`StatusEvent`]s to re-render when it changes.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ts_rs::TS;

/// Resolution progress of one attachment in one notebook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum ResolveStatus {
    /// Lookup in flight.
    Resolving,
    /// Resolved, not yet confirmed by the kernel.
    PendingInjection,
    /// Bound in the kernel.
    Ready,
    /// Lookup or injection failed.
    Failed,
}

impl std::fmt::Display for ResolveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveStatus::Resolving => write!(f, "RESOLVING"),
            ResolveStatus::PendingInjection => write!(f, "PENDING_INJECTION"),
            ResolveStatus::Ready => write!(f, "READY"),
            ResolveStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Change notification sent to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Set {
        notebook_id: String,
        did: String,
        status: ResolveStatus,
    },
    Cleared {
        notebook_id: String,
    },
}

impl StatusEvent {
    /// Notebook the event belongs to.
    pub fn notebook_id(&self) -> &str {
        match self {
            StatusEvent::Set { notebook_id, .. } | StatusEvent::Cleared { notebook_id } => {
                notebook_id
            }
        }
    }
}

/// Keyed store of resolution statuses with change broadcast.
pub struct StatusRegistry {
    statuses: StdMutex<HashMap<String, HashMap<String, ResolveStatus>>>,
    changed_tx: broadcast::Sender<StatusEvent>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        let (changed_tx, _) = broadcast::channel(256);
        Self {
            statuses: StdMutex::new(HashMap::new()),
            changed_tx,
        }
    }

    /// Upsert the status of `did` in `notebook_id`.
    pub fn set_status(&self, notebook_id: &str, did: &str, status: ResolveStatus) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses
                .entry(notebook_id.to_string())
                .or_default()
                .insert(did.to_string(), status);
        }
        debug!("[status] {} {} -> {}", notebook_id, did, status);
        // No subscribers is fine
        let _ = self.changed_tx.send(StatusEvent::Set {
            notebook_id: notebook_id.to_string(),
            did: did.to_string(),
            status,
        });
    }

    /// Current status, or `None` if never attempted or cleared.
    pub fn get_status(&self, notebook_id: &str, did: &str) -> Option<ResolveStatus> {
        let statuses = self.statuses.lock().ok()?;
        statuses.get(notebook_id)?.get(did).copied()
    }

    /// All statuses for one notebook.
    pub fn notebook_statuses(&self, notebook_id: &str) -> HashMap<String, ResolveStatus> {
        self.statuses
            .lock()
            .ok()
            .and_then(|s| s.get(notebook_id).cloned())
            .unwrap_or_default()
    }

    /// Replace the notebook's statuses with an empty map. Idempotent.
    pub fn clear_notebook(&self, notebook_id: &str) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.insert(notebook_id.to_string(), HashMap::new());
        }
        let _ = self.changed_tx.send(StatusEvent::Cleared {
            notebook_id: notebook_id.to_string(),
        });
    }

    /// Forget a closed notebook entirely.
    pub fn remove_notebook(&self, notebook_id: &str) {
        let removed = self
            .statuses
            .lock()
            .map(|mut statuses| statuses.remove(notebook_id).is_some())
            .unwrap_or(false);
        if removed {
            let _ = self.changed_tx.send(StatusEvent::Cleared {
                notebook_id: notebook_id.to_string(),
            });
        }
    }

    /// Subscribe to every subsequent change.
    ///
    /// Lagging receivers drop old events; call [`get_status`](Self::get_status)
    /// after a `Lagged` error to resynchronize.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.changed_tx.subscribe()
    }
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new()
    }
}
