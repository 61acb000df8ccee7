//! In-memory fakes for the lookup service and kernel transport.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::attachment::FileDidDetails;
use crate::error::{AttachError, Result};
use crate::kernel::{Comm, IncomingComm, KernelConnection};
use crate::lookup::DidLookup;

/// Lookup service answering from fixed tables.
pub struct FakeLookup {
    files: StdMutex<HashMap<String, FileDidDetails>>,
    instance_files: StdMutex<HashMap<(String, String), FileDidDetails>>,
    containers: StdMutex<HashMap<String, Vec<FileDidDetails>>>,
    failing: StdMutex<HashSet<String>>,
    calls: AtomicUsize,
    gate: watch::Sender<bool>,
    /// Only lookups against this instance wait on the gate. `None` holds all.
    held_instance: StdMutex<Option<String>>,
}

impl FakeLookup {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            files: StdMutex::new(HashMap::new()),
            instance_files: StdMutex::new(HashMap::new()),
            containers: StdMutex::new(HashMap::new()),
            failing: StdMutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
            gate,
            held_instance: StdMutex::new(None),
        })
    }

    pub fn with_file(self: &Arc<Self>, did: &str, path: &str) -> Arc<Self> {
        self.files
            .lock()
            .unwrap()
            .insert(did.to_string(), FileDidDetails::available(did, path));
        self.clone()
    }

    /// A file whose path depends on the instance it is looked up against.
    pub fn with_instance_file(self: &Arc<Self>, instance: &str, did: &str, path: &str) -> Arc<Self> {
        self.instance_files.lock().unwrap().insert(
            (instance.to_string(), did.to_string()),
            FileDidDetails::available(did, path),
        );
        self.clone()
    }

    pub fn with_container(self: &Arc<Self>, did: &str, paths: &[&str]) -> Arc<Self> {
        let details = paths
            .iter()
            .enumerate()
            .map(|(i, p)| FileDidDetails::available(&format!("{}#{}", did, i), p))
            .collect();
        self.containers
            .lock()
            .unwrap()
            .insert(did.to_string(), details);
        self.clone()
    }

    pub fn with_failure(self: &Arc<Self>, did: &str) -> Arc<Self> {
        self.failing.lock().unwrap().insert(did.to_string());
        self.clone()
    }

    /// Block every lookup until [`release`](Self::release).
    pub fn hold(&self) {
        *self.held_instance.lock().unwrap() = None;
        self.gate.send_replace(false);
    }

    /// Block only lookups against `instance` until [`release`](Self::release).
    pub fn hold_instance(&self, instance: &str) {
        *self.held_instance.lock().unwrap() = Some(instance.to_string());
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn wait_for_gate(&self, instance: &str) {
        let held = self.held_instance.lock().unwrap().clone();
        if held.is_some_and(|held| held != instance) {
            return;
        }
        let mut rx = self.gate.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[async_trait]
impl DidLookup for FakeLookup {
    async fn lookup_file(&self, instance: &str, did: &str) -> Result<FileDidDetails> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.wait_for_gate(instance).await;
        if self.failing.lock().unwrap().contains(did) {
            return Err(AttachError::lookup(did, "lookup service unavailable"));
        }
        let key = (instance.to_string(), did.to_string());
        if let Some(details) = self.instance_files.lock().unwrap().get(&key) {
            return Ok(details.clone());
        }
        self.files
            .lock()
            .unwrap()
            .get(did)
            .cloned()
            .ok_or_else(|| AttachError::lookup(did, "not found"))
    }

    async fn lookup_container(&self, instance: &str, did: &str) -> Result<Vec<FileDidDetails>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.wait_for_gate(instance).await;
        if self.failing.lock().unwrap().contains(did) {
            return Err(AttachError::lookup(did, "lookup service unavailable"));
        }
        self.containers
            .lock()
            .unwrap()
            .get(did)
            .cloned()
            .ok_or_else(|| AttachError::lookup(did, "not found"))
    }
}

/// Comm that records what was sent over it.
pub struct FakeComm {
    comm_id: String,
    target_name: String,
    sent: StdMutex<Vec<serde_json::Value>>,
    closed: AtomicBool,
    fail_sends: bool,
}

impl FakeComm {
    pub fn new(target_name: &str, fail_sends: bool) -> Arc<Self> {
        Arc::new(Self {
            comm_id: uuid::Uuid::new_v4().to_string(),
            target_name: target_name.to_string(),
            sent: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_sends,
        })
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn sent(&self) -> Vec<serde_json::Value> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Comm for FakeComm {
    fn comm_id(&self) -> &str {
        &self.comm_id
    }

    async fn send(&self, data: serde_json::Value) -> Result<()> {
        if self.fail_sends {
            return Err(AttachError::channel("kernel went away"));
        }
        self.sent.lock().unwrap().push(data);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Kernel connection that keeps every comm it opens.
pub struct FakeKernel {
    id: String,
    opened: StdMutex<Vec<Arc<FakeComm>>>,
    targets: StdMutex<HashMap<String, mpsc::UnboundedSender<IncomingComm>>>,
    fail_opens: AtomicBool,
    fail_sends: AtomicBool,
}

impl FakeKernel {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            opened: StdMutex::new(Vec::new()),
            targets: StdMutex::new(HashMap::new()),
            fail_opens: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        })
    }

    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Comms the front end opened, in order.
    pub fn opened_comms(&self) -> Vec<Arc<FakeComm>> {
        self.opened.lock().unwrap().clone()
    }

    /// Every message sent over front-end-opened comms.
    pub fn sent_messages(&self) -> Vec<serde_json::Value> {
        self.opened_comms().iter().flat_map(|c| c.sent()).collect()
    }

    pub fn has_target(&self, target_name: &str) -> bool {
        self.targets.lock().unwrap().contains_key(target_name)
    }

    /// Simulate the kernel opening a comm on `target_name`.
    ///
    /// Returns the front end's side of the comm and a sender for further
    /// kernel messages, or `None` if no target is registered.
    pub fn open_from_kernel(
        &self,
        target_name: &str,
        open_data: serde_json::Value,
    ) -> Option<(Arc<FakeComm>, mpsc::UnboundedSender<serde_json::Value>)> {
        let targets = self.targets.lock().unwrap();
        let target = targets.get(target_name)?;
        let comm = FakeComm::new(target_name, self.fail_sends.load(Ordering::SeqCst));
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        target
            .send(IncomingComm {
                comm: comm.clone(),
                open_data,
                messages: msg_rx,
            })
            .ok()?;
        Some((comm, msg_tx))
    }
}

#[async_trait]
impl KernelConnection for FakeKernel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open_comm(&self, target_name: &str) -> Result<Arc<dyn Comm>> {
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(AttachError::channel("comm_open rejected"));
        }
        let comm = FakeComm::new(target_name, self.fail_sends.load(Ordering::SeqCst));
        self.opened.lock().unwrap().push(comm.clone());
        Ok(comm)
    }

    fn register_comm_target(&self, target_name: &str) -> mpsc::UnboundedReceiver<IncomingComm> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.targets
            .lock()
            .unwrap()
            .insert(target_name.to_string(), tx);
        rx
    }
}

/// Wait until `condition` holds, yielding to spawned tasks in between.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(condition(), "condition not reached");
}
