//! Per-kernel-connection bookkeeping.
//!
//! Tracks, for every attached kernel connection, the notebook that owns it
//! and the variable names already bound in it. Each entry carries an epoch
//! that is bumped whenever its injected state is reset (restart, config
//! change). Work started under an older epoch, or for a kernel that has
//! since detached, is discarded when it completes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::task::JoinHandle;

use crate::kernel::KernelConnection;

/// Identity of one phase of one kernel connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelScope {
    pub kernel_id: String,
    pub notebook_id: String,
    pub epoch: u64,
}

struct KernelEntry {
    kernel: Arc<dyn KernelConnection>,
    notebook_id: String,
    epoch: u64,
    /// Insertion-ordered, no duplicates.
    injected: Vec<String>,
    /// Inbound comm listener, aborted on detach.
    listener: Option<JoinHandle<()>>,
}

impl Drop for KernelEntry {
    fn drop(&mut self) {
        if let Some(task) = self.listener.take() {
            task.abort();
        }
    }
}

/// Table of attached kernel connections.
pub struct KernelTable {
    entries: StdMutex<HashMap<String, KernelEntry>>,
    next_epoch: AtomicU64,
}

impl KernelTable {
    pub fn new() -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(1),
        }
    }

    fn bump_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed)
    }

    /// Record `kernel` as attached to `notebook_id`, replacing any previous
    /// entry with the same id.
    pub fn attach(&self, kernel: Arc<dyn KernelConnection>, notebook_id: &str) -> KernelScope {
        let epoch = self.bump_epoch();
        let kernel_id = kernel.id().to_string();
        let entry = KernelEntry {
            kernel,
            notebook_id: notebook_id.to_string(),
            epoch,
            injected: Vec::new(),
            listener: None,
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(kernel_id.clone(), entry);
        }
        KernelScope {
            kernel_id,
            notebook_id: notebook_id.to_string(),
            epoch,
        }
    }

    /// Attach the inbound listener task to a kernel's entry.
    ///
    /// The task is aborted right away if the kernel is no longer attached.
    pub fn set_listener(&self, kernel_id: &str, task: JoinHandle<()>) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => {
                task.abort();
                return;
            }
        };
        match entries.get_mut(kernel_id) {
            Some(entry) => {
                if let Some(previous) = entry.listener.replace(task) {
                    previous.abort();
                }
            }
            None => task.abort(),
        }
    }

    /// Remove the kernel's entry. Returns the notebook it belonged to.
    pub fn detach(&self, kernel_id: &str) -> Option<String> {
        let entry = self.entries.lock().ok()?.remove(kernel_id)?;
        Some(entry.notebook_id.clone())
    }

    /// Clear the kernel's injected names and start a new epoch.
    /// Returns the notebook it belongs to.
    pub fn reset(&self, kernel_id: &str) -> Option<String> {
        let epoch = self.bump_epoch();
        let mut entries = self.entries.lock().ok()?;
        let entry = entries.get_mut(kernel_id)?;
        entry.injected.clear();
        entry.epoch = epoch;
        Some(entry.notebook_id.clone())
    }

    /// Reset every kernel. Returns the new scope of each.
    pub fn reset_all(&self) -> Vec<KernelScope> {
        let epoch = self.bump_epoch();
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        entries
            .iter_mut()
            .map(|(kernel_id, entry)| {
                entry.injected.clear();
                entry.epoch = epoch;
                KernelScope {
                    kernel_id: kernel_id.clone(),
                    notebook_id: entry.notebook_id.clone(),
                    epoch,
                }
            })
            .collect()
    }

    /// Current scope of an attached kernel.
    pub fn scope(&self, kernel_id: &str) -> Option<KernelScope> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(kernel_id)?;
        Some(KernelScope {
            kernel_id: kernel_id.to_string(),
            notebook_id: entry.notebook_id.clone(),
            epoch: entry.epoch,
        })
    }

    /// Whether work started under `scope` may still write state.
    pub fn is_current(&self, scope: &KernelScope) -> bool {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| {
                entries
                    .get(&scope.kernel_id)
                    .map(|e| e.epoch == scope.epoch && e.notebook_id == scope.notebook_id)
            })
            .unwrap_or(false)
    }

    pub fn kernel(&self, kernel_id: &str) -> Option<Arc<dyn KernelConnection>> {
        let entries = self.entries.lock().ok()?;
        entries.get(kernel_id).map(|e| e.kernel.clone())
    }

    /// Notebook owning `kernel_id`.
    pub fn notebook_for(&self, kernel_id: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        entries.get(kernel_id).map(|e| e.notebook_id.clone())
    }

    /// Kernel attached to `notebook_id`, if any.
    pub fn kernel_for_notebook(&self, notebook_id: &str) -> Option<Arc<dyn KernelConnection>> {
        let entries = self.entries.lock().ok()?;
        entries
            .values()
            .find(|e| e.notebook_id == notebook_id)
            .map(|e| e.kernel.clone())
    }

    /// Every attached kernel with its current scope.
    pub fn attached(&self) -> Vec<(Arc<dyn KernelConnection>, KernelScope)> {
        let entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        entries
            .iter()
            .map(|(kernel_id, e)| {
                (
                    e.kernel.clone(),
                    KernelScope {
                        kernel_id: kernel_id.clone(),
                        notebook_id: e.notebook_id.clone(),
                        epoch: e.epoch,
                    },
                )
            })
            .collect()
    }

    /// Variable names bound in the kernel, in first-injected order.
    pub fn injected(&self, kernel_id: &str) -> Vec<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(kernel_id).map(|e| e.injected.clone()))
            .unwrap_or_default()
    }

    /// Append names under `scope`, skipping ones already present.
    /// Returns false if the scope is stale and nothing was recorded.
    pub fn append_injected(&self, scope: &KernelScope, names: &[String]) -> bool {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => return false,
        };
        match entries.get_mut(&scope.kernel_id) {
            Some(entry) if entry.epoch == scope.epoch => {
                for name in names {
                    if !entry.injected.contains(name) {
                        entry.injected.push(name.clone());
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Keep only names for which `keep` returns true.
    pub fn retain_injected(&self, kernel_id: &str, keep: impl Fn(&str) -> bool) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(kernel_id) {
                entry.injected.retain(|name| keep(name));
            }
        }
    }
}

impl Default for KernelTable {
    fn default() -> Self {
        Self::new()
    }
}
