//! Notebook documents and their session lifecycle events.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use serde::Serialize;

use crate::attachment::{parse_attachments, Attachment, METADATA_KEY};
use crate::error::Result;
use crate::kernel::KernelConnection;

/// A notebook document as seen by the coordinator.
pub trait NotebookDocument: Send + Sync {
    /// Stable identity of the open document.
    fn id(&self) -> &str;

    /// Notebook-level metadata value stored under `key`.
    fn metadata(&self, key: &str) -> Option<serde_json::Value>;

    /// Validated attachment list.
    fn attachments(&self) -> Result<Vec<Attachment>> {
        parse_attachments(self.metadata(METADATA_KEY))
    }
}

/// Kernel status as reported by the notebook session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    Unknown,
    Starting,
    Idle,
    Busy,
    Restarting,
    Autorestarting,
    Dead,
}

impl KernelStatus {
    /// Whether the kernel is going through a restart.
    pub fn is_restart(&self) -> bool {
        matches!(self, KernelStatus::Restarting | KernelStatus::Autorestarting)
    }
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Unknown => write!(f, "unknown"),
            KernelStatus::Starting => write!(f, "starting"),
            KernelStatus::Idle => write!(f, "idle"),
            KernelStatus::Busy => write!(f, "busy"),
            KernelStatus::Restarting => write!(f, "restarting"),
            KernelStatus::Autorestarting => write!(f, "autorestarting"),
            KernelStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Events emitted by a notebook's session.
#[derive(Clone)]
pub enum SessionEvent {
    /// The session's kernel status changed.
    StatusChanged(KernelStatus),
    /// The session's kernel was replaced, attached, or detached.
    KernelChanged {
        old: Option<Arc<dyn KernelConnection>>,
        new: Option<Arc<dyn KernelConnection>>,
    },
    /// The session finished starting. Emitted once.
    Ready,
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::StatusChanged(status) => write!(f, "StatusChanged({})", status),
            SessionEvent::KernelChanged { old, new } => write!(
                f,
                "KernelChanged {{ old: {:?}, new: {:?} }}",
                old.as_ref().map(|k| k.id()),
                new.as_ref().map(|k| k.id())
            ),
            SessionEvent::Ready => write!(f, "Ready"),
        }
    }
}

/// Notebooks currently open, by id.
#[derive(Default)]
pub struct OpenNotebooks {
    notebooks: StdMutex<HashMap<String, Arc<dyn NotebookDocument>>>,
}

impl OpenNotebooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, notebook: Arc<dyn NotebookDocument>) {
        if let Ok(mut notebooks) = self.notebooks.lock() {
            notebooks.insert(notebook.id().to_string(), notebook);
        }
    }

    pub fn remove(&self, notebook_id: &str) -> Option<Arc<dyn NotebookDocument>> {
        self.notebooks.lock().ok()?.remove(notebook_id)
    }

    pub fn get(&self, notebook_id: &str) -> Option<Arc<dyn NotebookDocument>> {
        self.notebooks.lock().ok()?.get(notebook_id).cloned()
    }
}

/// A notebook backed by an `.ipynb` file.
///
/// Only the notebook-level metadata is kept; cells are irrelevant here.
pub struct IpynbNotebook {
    id: String,
    path: Option<PathBuf>,
    metadata: RwLock<serde_json::Value>,
}

impl IpynbNotebook {
    /// Build a document from an in-memory metadata object.
    pub fn from_metadata(id: &str, metadata: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            path: None,
            metadata: RwLock::new(metadata),
        }
    }

    /// Load a notebook file. The id is the canonical path.
    pub fn load(path: &Path) -> Result<Self> {
        let metadata = read_metadata(path)?;
        let id = std::fs::canonicalize(path)
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .to_string();
        Ok(Self {
            id,
            path: Some(path.to_path_buf()),
            metadata: RwLock::new(metadata),
        })
    }

    /// Re-read metadata from disk. No-op for in-memory documents.
    pub fn reload(&self) -> Result<()> {
        if let Some(ref path) = self.path {
            let metadata = read_metadata(path)?;
            self.set_metadata(metadata);
        }
        Ok(())
    }

    /// Replace the whole metadata object.
    pub fn set_metadata(&self, metadata: serde_json::Value) {
        if let Ok(mut current) = self.metadata.write() {
            *current = metadata;
        }
    }

    /// Replace the attachment list in metadata.
    pub fn set_attachments(&self, attachments: &[Attachment]) {
        if let Ok(mut current) = self.metadata.write() {
            if !current.is_object() {
                *current = serde_json::json!({});
            }
            current[METADATA_KEY] = serde_json::to_value(attachments).unwrap_or_default();
        }
    }
}

fn read_metadata(path: &Path) -> Result<serde_json::Value> {
    let contents = std::fs::read_to_string(path)?;
    let notebook: serde_json::Value = serde_json::from_str(&contents)?;
    Ok(notebook
        .get("metadata")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({})))
}

impl NotebookDocument for IpynbNotebook {
    fn id(&self) -> &str {
        &self.id
    }

    fn metadata(&self, key: &str) -> Option<serde_json::Value> {
        self.metadata.read().ok()?.get(key).cloned()
    }
}
