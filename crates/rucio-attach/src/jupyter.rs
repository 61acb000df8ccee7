//! [`KernelConnection`] over a running Jupyter kernel's ZeroMQ sockets.
//!
//! Outgoing `comm_open`/`comm_msg`/`comm_close` go out on the shell channel.
//! Kernel-originated comm traffic arrives on iopub and is routed to the
//! receiver registered for its target.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use jupyter_protocol::{
    ConnectionInfo, ExecutionState, JupyterMessage, JupyterMessageContent, KernelInfoRequest,
};
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{AttachError, Result};
use crate::kernel::{Comm, IncomingComm, KernelConnection};
use crate::notebook::KernelStatus;

type Shell = Arc<Mutex<runtimelib::DealerSendConnection>>;
type Targets = Arc<StdMutex<HashMap<String, mpsc::UnboundedSender<IncomingComm>>>>;

/// A connection to one kernel, identified by its client session.
pub struct JupyterKernelConnection {
    id: String,
    shell: Shell,
    targets: Targets,
    status_tx: broadcast::Sender<KernelStatus>,
    tasks: Vec<JoinHandle<()>>,
}

impl JupyterKernelConnection {
    /// Connect to the kernel described by a connection file.
    pub async fn connect(connection_file: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(connection_file).await?;
        let connection_info: ConnectionInfo = serde_json::from_str(&content)?;
        Self::connect_with_info(&connection_info).await
    }

    pub async fn connect_with_info(connection_info: &ConnectionInfo) -> anyhow::Result<Self> {
        let session_id = Uuid::new_v4().to_string();

        let mut iopub =
            runtimelib::create_client_iopub_connection(connection_info, "", &session_id).await?;

        let identity = runtimelib::peer_identity_for_session(&session_id)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            connection_info,
            &session_id,
            identity,
        )
        .await?;

        // Verify kernel is alive
        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await?;
        match tokio::time::timeout(Duration::from_secs(30), shell.read()).await {
            Ok(Ok(msg)) => info!(
                "[jupyter] Kernel alive: got {} reply",
                msg.header.msg_type
            ),
            Ok(Err(e)) => return Err(anyhow::anyhow!("Kernel did not respond: {}", e)),
            Err(_) => return Err(anyhow::anyhow!("Kernel did not respond within 30s")),
        }

        let (shell_writer, mut shell_reader) = shell.split();
        let shell: Shell = Arc::new(Mutex::new(shell_writer));
        let targets: Targets = Arc::new(StdMutex::new(HashMap::new()));
        let (status_tx, _) = broadcast::channel(16);

        // Comm traffic gets no shell replies; drain whatever arrives
        let shell_task = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(msg) => debug!("[jupyter] shell: {}", msg.header.msg_type),
                    Err(e) => {
                        warn!("[jupyter] shell read error: {}", e);
                        break;
                    }
                }
            }
        });

        let iopub_shell = shell.clone();
        let iopub_targets = targets.clone();
        let iopub_status_tx = status_tx.clone();
        let iopub_task = tokio::spawn(async move {
            let mut open_comms: HashMap<String, mpsc::UnboundedSender<serde_json::Value>> =
                HashMap::new();
            loop {
                let message = match iopub.read().await {
                    Ok(message) => message,
                    Err(e) => {
                        error!("[jupyter] iopub read error: {}", e);
                        break;
                    }
                };
                match &message.content {
                    JupyterMessageContent::Status(status) => {
                        let _ = iopub_status_tx.send(kernel_status(&status.execution_state));
                    }
                    JupyterMessageContent::CommOpen(open) => {
                        let sender = iopub_targets
                            .lock()
                            .ok()
                            .and_then(|t| t.get(&open.target_name).cloned());
                        let Some(sender) = sender else {
                            debug!(
                                "[jupyter] No target {} for comm {}",
                                open.target_name, open.comm_id.0
                            );
                            continue;
                        };
                        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
                        let comm = JupyterComm::new(open.comm_id.0.clone(), iopub_shell.clone());
                        let incoming = IncomingComm {
                            comm: Arc::new(comm),
                            open_data: serde_json::to_value(&open.data).unwrap_or_default(),
                            messages: msg_rx,
                        };
                        if sender.send(incoming).is_ok() {
                            open_comms.insert(open.comm_id.0.clone(), msg_tx);
                        }
                    }
                    JupyterMessageContent::CommMsg(msg) => {
                        if let Some(msg_tx) = open_comms.get(&msg.comm_id.0) {
                            let data = serde_json::to_value(&msg.data).unwrap_or_default();
                            if msg_tx.send(data).is_err() {
                                open_comms.remove(&msg.comm_id.0);
                            }
                        }
                    }
                    JupyterMessageContent::CommClose(close) => {
                        open_comms.remove(&close.comm_id.0);
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            id: session_id,
            shell,
            targets,
            status_tx,
            tasks: vec![shell_task, iopub_task],
        })
    }

    /// Kernel execution states as published on iopub.
    pub fn subscribe_status(&self) -> broadcast::Receiver<KernelStatus> {
        self.status_tx.subscribe()
    }
}

impl Drop for JupyterKernelConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn kernel_status(state: &ExecutionState) -> KernelStatus {
    match state {
        ExecutionState::Busy => KernelStatus::Busy,
        ExecutionState::Idle => KernelStatus::Idle,
        ExecutionState::Starting => KernelStatus::Starting,
        ExecutionState::Restarting => KernelStatus::Restarting,
        ExecutionState::Terminating | ExecutionState::Dead => KernelStatus::Dead,
        #[allow(unreachable_patterns)]
        _ => KernelStatus::Unknown,
    }
}

async fn send_on_shell(shell: &Shell, msg_type: &str, content: serde_json::Value) -> Result<()> {
    let content = JupyterMessageContent::from_type_and_content(msg_type, content)
        .map_err(AttachError::channel)?;
    let mut message = JupyterMessage::new(content, None);
    message.channel = Some(jupyter_protocol::Channel::Shell);
    debug!(
        "[jupyter] Sending {} msg_id={}",
        msg_type, message.header.msg_id
    );
    shell
        .lock()
        .await
        .send(message)
        .await
        .map_err(AttachError::channel)
}

#[async_trait]
impl KernelConnection for JupyterKernelConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open_comm(&self, target_name: &str) -> Result<Arc<dyn Comm>> {
        let comm_id = Uuid::new_v4().to_string();
        send_on_shell(
            &self.shell,
            "comm_open",
            json!({
                "comm_id": comm_id,
                "target_name": target_name,
                "data": {},
            }),
        )
        .await?;
        Ok(Arc::new(JupyterComm::new(comm_id, self.shell.clone())))
    }

    fn register_comm_target(&self, target_name: &str) -> mpsc::UnboundedReceiver<IncomingComm> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut targets) = self.targets.lock() {
            targets.insert(target_name.to_string(), tx);
        }
        rx
    }
}

/// A comm on a [`JupyterKernelConnection`].
pub struct JupyterComm {
    comm_id: String,
    shell: Shell,
    closed: AtomicBool,
}

impl JupyterComm {
    fn new(comm_id: String, shell: Shell) -> Self {
        Self {
            comm_id,
            shell,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Comm for JupyterComm {
    fn comm_id(&self) -> &str {
        &self.comm_id
    }

    async fn send(&self, data: serde_json::Value) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AttachError::channel(format!(
                "comm {} is closed",
                self.comm_id
            )));
        }
        send_on_shell(
            &self.shell,
            "comm_msg",
            json!({"comm_id": self.comm_id, "data": data}),
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        send_on_shell(
            &self.shell,
            "comm_close",
            json!({"comm_id": self.comm_id, "data": {}}),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_state_mapping() {
        assert_eq!(
            kernel_status(&ExecutionState::Restarting),
            KernelStatus::Restarting
        );
        assert!(kernel_status(&ExecutionState::Restarting).is_restart());
        assert_eq!(kernel_status(&ExecutionState::Dead), KernelStatus::Dead);
        assert_eq!(kernel_status(&ExecutionState::Idle), KernelStatus::Idle);
    }

    #[test]
    fn test_comm_payloads_parse_as_protocol_content() {
        let open = JupyterMessageContent::from_type_and_content(
            "comm_open",
            json!({"comm_id": "c1", "target_name": "rucio.kernel", "data": {}}),
        )
        .unwrap();
        match open {
            JupyterMessageContent::CommOpen(open) => {
                assert_eq!(open.comm_id.0, "c1");
                assert_eq!(open.target_name, "rucio.kernel");
            }
            other => panic!("unexpected content: {:?}", other),
        }

        let msg = JupyterMessageContent::from_type_and_content(
            "comm_msg",
            json!({"comm_id": "c1", "data": {"action": "inject", "dids": []}}),
        )
        .unwrap();
        assert!(matches!(msg, JupyterMessageContent::CommMsg(_)));
    }
}
