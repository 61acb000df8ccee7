//! Handles comms the kernel opens on [`FRONTEND_COMM_TARGET`].
//!
//! The kernel-side extension uses this channel after it starts (or after a
//! restart) to ask for its variables, and to report variables it restored
//! on its own. Both the `comm_open` payload and every later `comm_msg` are
//! dispatched the same way.
//!
//! [`FRONTEND_COMM_TARGET`]: crate::protocol::FRONTEND_COMM_TARGET

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::ActiveInstance;
use crate::kernel::{Comm, IncomingComm};
use crate::kernels::KernelTable;
use crate::notebook::OpenNotebooks;
use crate::protocol::{FrontendMessage, KernelMessage};
use crate::resolver::AttachmentResolver;
use crate::status::{ResolveStatus, StatusRegistry};

pub struct InboundHandler {
    kernels: Arc<KernelTable>,
    notebooks: Arc<OpenNotebooks>,
    active: ActiveInstance,
    resolver: Arc<AttachmentResolver>,
    status: Arc<StatusRegistry>,
}

impl InboundHandler {
    pub fn new(
        kernels: Arc<KernelTable>,
        notebooks: Arc<OpenNotebooks>,
        active: ActiveInstance,
        resolver: Arc<AttachmentResolver>,
        status: Arc<StatusRegistry>,
    ) -> Self {
        Self {
            kernels,
            notebooks,
            active,
            resolver,
            status,
        }
    }

    /// Serve every comm the kernel opens until the target is dropped.
    ///
    /// Each comm is handled on its own task; all of them are cancelled when
    /// this future is.
    pub async fn serve(
        self: Arc<Self>,
        kernel_id: String,
        mut incoming: mpsc::UnboundedReceiver<IncomingComm>,
    ) {
        let mut comms = JoinSet::new();

        loop {
            tokio::select! {
                next = incoming.recv() => {
                    let Some(IncomingComm { comm, open_data, mut messages }) = next else {
                        break;
                    };
                    debug!(
                        "[inbound] Kernel {} opened comm {}",
                        kernel_id,
                        comm.comm_id()
                    );
                    let handler = self.clone();
                    let kernel_id = kernel_id.clone();
                    comms.spawn(async move {
                        handler.dispatch(&kernel_id, comm.as_ref(), &open_data).await;
                        while let Some(data) = messages.recv().await {
                            handler.dispatch(&kernel_id, comm.as_ref(), &data).await;
                        }
                        debug!("[inbound] Comm {} closed", comm.comm_id());
                    });
                }
                Some(_) = comms.join_next(), if !comms.is_empty() => {}
            }
        }

        while comms.join_next().await.is_some() {}
    }

    /// Handle one payload received on `comm` from kernel `kernel_id`.
    pub async fn dispatch(&self, kernel_id: &str, comm: &dyn Comm, data: &serde_json::Value) {
        if is_empty_payload(data) {
            debug!("[inbound] Empty payload on comm {}", comm.comm_id());
            return;
        }

        let message = match FrontendMessage::from_data(data) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "[inbound] Ignoring unrecognized message on comm {}: {}",
                    comm.comm_id(),
                    e
                );
                return;
            }
        };

        match message {
            FrontendMessage::RequestInject => self.handle_request_inject(kernel_id, comm).await,
            FrontendMessage::AckInject { variable_names } => {
                self.handle_ack_inject(kernel_id, &variable_names)
            }
        }
    }

    async fn handle_request_inject(&self, kernel_id: &str, comm: &dyn Comm) {
        let Some(scope) = self.kernels.scope(kernel_id) else {
            warn!("[inbound] request-inject from unattached kernel {}", kernel_id);
            return;
        };
        let Some(instance) = self.active.get() else {
            debug!("[inbound] No active instance, ignoring request-inject");
            return;
        };
        let Some(notebook) = self.notebooks.get(&scope.notebook_id) else {
            warn!("[inbound] Notebook {} is not open", scope.notebook_id);
            return;
        };
        let attachments = match notebook.attachments() {
            Ok(attachments) => attachments,
            Err(e) => {
                error!("[inbound] {}: {}", scope.notebook_id, e);
                return;
            }
        };
        if attachments.is_empty() {
            return;
        }

        info!(
            "[inbound] Kernel {} requested {} attachment(s)",
            kernel_id,
            attachments.len()
        );

        let injections: Vec<_> = self
            .resolver
            .resolve_all(&instance.name, &attachments, &scope)
            .await
            .into_iter()
            .flatten()
            .collect();

        if !self.kernels.is_current(&scope) {
            debug!("[inbound] Kernel {} was reset, dropping reply", kernel_id);
            return;
        }

        let message = KernelMessage::Inject {
            dids: injections.clone(),
        };
        let status = match comm.send(message.to_data()).await {
            Ok(()) => ResolveStatus::Ready,
            Err(e) => {
                error!("[inbound] Failed to reply on comm {}: {}", comm.comm_id(), e);
                ResolveStatus::Failed
            }
        };

        if !self.kernels.is_current(&scope) {
            debug!("[inbound] Kernel {} was reset during reply", kernel_id);
            return;
        }
        for injection in &injections {
            self.status
                .set_status(&scope.notebook_id, &injection.did, status);
        }
    }

    fn handle_ack_inject(&self, kernel_id: &str, variable_names: &[String]) {
        let Some(scope) = self.kernels.scope(kernel_id) else {
            warn!("[inbound] ack-inject from unattached kernel {}", kernel_id);
            return;
        };
        debug!(
            "[inbound] Kernel {} acknowledged {:?}",
            kernel_id, variable_names
        );
        self.kernels.append_injected(&scope, variable_names);
    }
}

fn is_empty_payload(data: &serde_json::Value) -> bool {
    match data {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::Attachment;
    use crate::config::{Instance, InstanceMode};
    use crate::kernel::KernelConnection;
    use crate::notebook::IpynbNotebook;
    use crate::protocol::FRONTEND_COMM_TARGET;
    use crate::testing::{eventually, FakeComm, FakeKernel, FakeLookup};
    use serde_json::json;

    struct Fixture {
        handler: Arc<InboundHandler>,
        kernels: Arc<KernelTable>,
        notebooks: Arc<OpenNotebooks>,
        active: ActiveInstance,
        status: Arc<StatusRegistry>,
    }

    fn fixture(lookup: Arc<FakeLookup>) -> Fixture {
        let kernels = Arc::new(KernelTable::new());
        let notebooks = Arc::new(OpenNotebooks::new());
        let status = Arc::new(StatusRegistry::new());
        let active = ActiveInstance::new(Some(Instance {
            name: "atlas".to_string(),
            display_name: "ATLAS".to_string(),
            mode: InstanceMode::Replica,
        }));
        let resolver = Arc::new(AttachmentResolver::new(
            lookup,
            status.clone(),
            kernels.clone(),
        ));
        let handler = Arc::new(InboundHandler::new(
            kernels.clone(),
            notebooks.clone(),
            active.clone(),
            resolver,
            status.clone(),
        ));
        Fixture {
            handler,
            kernels,
            notebooks,
            active,
            status,
        }
    }

    fn open_notebook(fx: &Fixture, attachments: &[Attachment]) {
        let notebook = IpynbNotebook::from_metadata("nb-1", json!({}));
        notebook.set_attachments(attachments);
        fx.notebooks.insert(Arc::new(notebook));
    }

    #[tokio::test]
    async fn test_request_inject_replies_on_same_comm() {
        let fx = fixture(FakeLookup::new().with_file("did:1", "/data/1"));
        open_notebook(&fx, &[Attachment::file("ds1", "did:1")]);
        let kernel = FakeKernel::new("k1");
        fx.kernels.attach(kernel.clone(), "nb-1");
        let comm = FakeComm::new("rucio.frontend", false);

        fx.handler
            .dispatch("k1", comm.as_ref(), &json!({"action": "request-inject"}))
            .await;

        assert_eq!(
            comm.sent(),
            vec![json!({
                "action": "inject",
                "dids": [{"variableName": "ds1", "path": "/data/1", "did": "did:1"}]
            })]
        );
        assert_eq!(
            fx.status.get_status("nb-1", "did:1"),
            Some(ResolveStatus::Ready)
        );
        // Direct replies are not tracked as injected
        assert!(fx.kernels.injected("k1").is_empty());
        assert!(kernel.opened_comms().is_empty());
    }

    #[tokio::test]
    async fn test_request_inject_send_failure_marks_failed() {
        let fx = fixture(FakeLookup::new().with_file("did:1", "/data/1"));
        open_notebook(&fx, &[Attachment::file("ds1", "did:1")]);
        fx.kernels.attach(FakeKernel::new("k1"), "nb-1");
        let comm = FakeComm::new("rucio.frontend", true);

        fx.handler
            .dispatch("k1", comm.as_ref(), &json!({"action": "request-inject"}))
            .await;

        assert_eq!(
            fx.status.get_status("nb-1", "did:1"),
            Some(ResolveStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_request_inject_reset_during_resolution_sends_nothing() {
        let lookup = FakeLookup::new().with_file("did:1", "/data/1");
        let fx = fixture(lookup.clone());
        open_notebook(&fx, &[Attachment::file("ds1", "did:1")]);
        fx.kernels.attach(FakeKernel::new("k1"), "nb-1");
        let comm = FakeComm::new("rucio.frontend", false);

        lookup.hold();
        let request = {
            let handler = fx.handler.clone();
            let comm = comm.clone();
            tokio::spawn(async move {
                handler
                    .dispatch("k1", comm.as_ref(), &json!({"action": "request-inject"}))
                    .await
            })
        };
        eventually(|| lookup.calls() == 1).await;

        fx.kernels.reset("k1");
        lookup.release();
        request.await.unwrap();

        assert!(comm.sent().is_empty());
        // Left at the value written before the reset
        assert_eq!(
            fx.status.get_status("nb-1", "did:1"),
            Some(ResolveStatus::Resolving)
        );
    }

    #[tokio::test]
    async fn test_request_inject_without_instance_does_nothing() {
        let lookup = FakeLookup::new().with_file("did:1", "/data/1");
        let fx = fixture(lookup.clone());
        fx.active.set(None);
        open_notebook(&fx, &[Attachment::file("ds1", "did:1")]);
        fx.kernels.attach(FakeKernel::new("k1"), "nb-1");
        let comm = FakeComm::new("rucio.frontend", false);

        fx.handler
            .dispatch("k1", comm.as_ref(), &json!({"action": "request-inject"}))
            .await;

        assert!(comm.sent().is_empty());
        assert_eq!(lookup.calls(), 0);
        assert_eq!(fx.status.get_status("nb-1", "did:1"), None);
    }

    #[tokio::test]
    async fn test_request_inject_without_attachments_does_nothing() {
        let fx = fixture(FakeLookup::new());
        open_notebook(&fx, &[]);
        fx.kernels.attach(FakeKernel::new("k1"), "nb-1");
        let comm = FakeComm::new("rucio.frontend", false);

        fx.handler
            .dispatch("k1", comm.as_ref(), &json!({"action": "request-inject"}))
            .await;

        assert!(comm.sent().is_empty());
    }

    #[tokio::test]
    async fn test_ack_inject_records_names_without_traffic() {
        let lookup = FakeLookup::new();
        let fx = fixture(lookup.clone());
        let kernel = FakeKernel::new("k1");
        fx.kernels.attach(kernel.clone(), "nb-1");
        let comm = FakeComm::new("rucio.frontend", false);

        fx.handler
            .dispatch(
                "k1",
                comm.as_ref(),
                &json!({"action": "ack-inject", "variable_names": ["z"]}),
            )
            .await;

        assert_eq!(fx.kernels.injected("k1"), vec!["z"]);
        assert!(comm.sent().is_empty());
        assert!(kernel.opened_comms().is_empty());
        assert_eq!(lookup.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_action_is_ignored() {
        let fx = fixture(FakeLookup::new());
        fx.kernels.attach(FakeKernel::new("k1"), "nb-1");
        let comm = FakeComm::new("rucio.frontend", false);

        fx.handler
            .dispatch("k1", comm.as_ref(), &json!({"action": "reboot"}))
            .await;
        fx.handler.dispatch("k1", comm.as_ref(), &json!({})).await;

        assert!(comm.sent().is_empty());
        assert!(fx.kernels.injected("k1").is_empty());
    }

    #[tokio::test]
    async fn test_serve_dispatches_open_and_later_messages() {
        let fx = fixture(FakeLookup::new().with_file("did:1", "/data/1"));
        open_notebook(&fx, &[Attachment::file("ds1", "did:1")]);
        let kernel = FakeKernel::new("k1");
        fx.kernels.attach(kernel.clone(), "nb-1");

        let incoming = kernel.register_comm_target(FRONTEND_COMM_TARGET);
        let task = tokio::spawn(fx.handler.clone().serve("k1".to_string(), incoming));

        let (comm, messages) = kernel
            .open_from_kernel("rucio.frontend", json!({"action": "request-inject"}))
            .unwrap();
        eventually(|| comm.sent().len() == 1).await;

        messages
            .send(json!({"action": "ack-inject", "variable_names": ["extra"]}))
            .unwrap();
        eventually(|| fx.kernels.injected("k1") == vec!["extra".to_string()]).await;

        task.abort();
    }
}
