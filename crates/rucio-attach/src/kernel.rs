//! Kernel connection and comm channel contract.
//!
//! The coordinator never talks to a transport directly. A host (the
//! ZeroMQ-backed [`JupyterKernelConnection`](crate::jupyter::JupyterKernelConnection),
//! or an in-memory fake in tests) implements these traits.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// One side of an open comm channel.
#[async_trait]
pub trait Comm: Send + Sync {
    /// The comm_id shared by both ends.
    fn comm_id(&self) -> &str;

    /// Send a `comm_msg` with `data` as its payload.
    async fn send(&self, data: serde_json::Value) -> Result<()>;

    /// Send `comm_close`.
    async fn close(&self) -> Result<()>;
}

/// A comm the kernel opened against a registered target.
pub struct IncomingComm {
    pub comm: Arc<dyn Comm>,
    /// `data` of the kernel's `comm_open`.
    pub open_data: serde_json::Value,
    /// `data` of every later `comm_msg`. Ends when the comm closes.
    pub messages: mpsc::UnboundedReceiver<serde_json::Value>,
}

/// A live connection to one kernel.
///
/// A connection handed over in a kernel change is a new logical connection
/// and must report a new [`id`](KernelConnection::id). A restart keeps it.
#[async_trait]
pub trait KernelConnection: Send + Sync {
    fn id(&self) -> &str;

    /// Create a comm for `target_name` and send its `comm_open`.
    async fn open_comm(&self, target_name: &str) -> Result<Arc<dyn Comm>>;

    /// Route kernel-opened comms for `target_name` to the returned receiver.
    ///
    /// Registering the same target again replaces the previous receiver.
    fn register_comm_target(&self, target_name: &str) -> mpsc::UnboundedReceiver<IncomingComm>;
}
