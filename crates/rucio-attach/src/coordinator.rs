//! Reacts to notebook, kernel, and configuration lifecycle events.
//!
//! The coordinator owns all per-kernel state (injected names, the
//! kernel-to-notebook mapping) through a [`KernelTable`], so independent
//! coordinators never share bookkeeping.
//!
//! Per kernel connection the states are unattached, attached, restarting,
//! and detached:
//! - attach registers the inbound comm target and runs a full injection pass
//! - restart clears injected names and statuses but keeps the mapping
//! - detach drops the mapping along with the kernel's names and statuses
//!
//! A change of the active instance resets every kernel and re-runs the full
//! pass for each. Nothing is injected while no instance is active.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::attachment::Attachment;
use crate::config::ActiveInstance;
use crate::inbound::InboundHandler;
use crate::injection::InjectionChannel;
use crate::kernel::KernelConnection;
use crate::kernels::{KernelScope, KernelTable};
use crate::lookup::DidLookup;
use crate::notebook::{NotebookDocument, OpenNotebooks, SessionEvent};
use crate::protocol::FRONTEND_COMM_TARGET;
use crate::resolver::AttachmentResolver;
use crate::status::{ResolveStatus, StatusRegistry};

struct Inner {
    kernels: Arc<KernelTable>,
    notebooks: Arc<OpenNotebooks>,
    status: Arc<StatusRegistry>,
    active: ActiveInstance,
    resolver: Arc<AttachmentResolver>,
    injection: InjectionChannel,
    inbound: Arc<InboundHandler>,
}

/// Drives attachment injection for every open notebook.
#[derive(Clone)]
pub struct KernelLifecycleCoordinator {
    inner: Arc<Inner>,
}

impl KernelLifecycleCoordinator {
    pub fn new(lookup: Arc<dyn DidLookup>, active: ActiveInstance) -> Self {
        let kernels = Arc::new(KernelTable::new());
        let notebooks = Arc::new(OpenNotebooks::new());
        let status = Arc::new(StatusRegistry::new());
        let resolver = Arc::new(AttachmentResolver::new(
            lookup,
            status.clone(),
            kernels.clone(),
        ));
        let inbound = Arc::new(InboundHandler::new(
            kernels.clone(),
            notebooks.clone(),
            active.clone(),
            resolver.clone(),
            status.clone(),
        ));
        Self {
            inner: Arc::new(Inner {
                injection: InjectionChannel::new(kernels.clone()),
                kernels,
                notebooks,
                status,
                active,
                resolver,
                inbound,
            }),
        }
    }

    pub fn status_registry(&self) -> Arc<StatusRegistry> {
        self.inner.status.clone()
    }

    pub fn active_instance(&self) -> &ActiveInstance {
        &self.inner.active
    }

    /// Track `notebook` and follow its session events until `events` closes.
    ///
    /// A kernel handed over before the session is ready is attached once
    /// [`SessionEvent::Ready`] arrives. When the event stream ends the
    /// notebook is treated as closed.
    pub fn on_notebook_opened(
        &self,
        notebook: Arc<dyn NotebookDocument>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> JoinHandle<()> {
        let notebook_id = notebook.id().to_string();
        self.inner.notebooks.insert(notebook);
        info!("[coordinator] Notebook opened: {}", notebook_id);

        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ready = false;
            let mut pending: Option<Arc<dyn KernelConnection>> = None;

            while let Some(event) = events.recv().await {
                debug!("[coordinator] {}: {:?}", notebook_id, event);
                match event {
                    SessionEvent::Ready => {
                        ready = true;
                        if let Some(kernel) = pending.take() {
                            coordinator.spawn_attach(&notebook_id, kernel);
                        }
                    }
                    SessionEvent::KernelChanged { old, new } => {
                        if let Some(old) = old {
                            coordinator.on_kernel_detached(old.id());
                        }
                        pending = None;
                        if let Some(new) = new {
                            if ready {
                                coordinator.spawn_attach(&notebook_id, new);
                            } else {
                                pending = Some(new);
                            }
                        }
                    }
                    SessionEvent::StatusChanged(status) if status.is_restart() => {
                        let kernels = &coordinator.inner.kernels;
                        if let Some(kernel) = kernels.kernel_for_notebook(&notebook_id) {
                            coordinator.on_kernel_restarting(kernel.id());
                        }
                    }
                    SessionEvent::StatusChanged(_) => {}
                }
            }

            coordinator.on_notebook_closed(&notebook_id);
        })
    }

    /// Forget a notebook: detach its kernel and drop its statuses.
    pub fn on_notebook_closed(&self, notebook_id: &str) {
        if let Some(kernel) = self.inner.kernels.kernel_for_notebook(notebook_id) {
            self.inner.kernels.detach(kernel.id());
        }
        self.inner.notebooks.remove(notebook_id);
        self.inner.status.remove_notebook(notebook_id);
        info!("[coordinator] Notebook closed: {}", notebook_id);
    }

    /// Attach `kernel` to `notebook_id` and run the full injection pass.
    pub async fn on_kernel_attached(&self, notebook_id: &str, kernel: Arc<dyn KernelConnection>) {
        let scope = self.attach_kernel(notebook_id, kernel.clone());
        self.full_pass(kernel, scope).await;
    }

    /// Drop the kernel's mapping, injected names, and its notebook's statuses.
    pub fn on_kernel_detached(&self, kernel_id: &str) {
        match self.inner.kernels.detach(kernel_id) {
            Some(notebook_id) => {
                self.inner.status.clear_notebook(&notebook_id);
                info!(
                    "[coordinator] Kernel {} detached from {}",
                    kernel_id, notebook_id
                );
            }
            None => debug!("[coordinator] Kernel {} was not attached", kernel_id),
        }
    }

    /// Clear injected names and statuses; the kernel stays mapped.
    pub fn on_kernel_restarting(&self, kernel_id: &str) {
        if let Some(notebook_id) = self.inner.kernels.reset(kernel_id) {
            self.inner.status.clear_notebook(&notebook_id);
            info!("[coordinator] Kernel {} restarting", kernel_id);
        }
    }

    /// Reset every kernel and re-run the full pass for each, ignoring
    /// what was injected before.
    pub async fn reinject_all(&self) {
        self.inner.kernels.reset_all();
        let attached = self.inner.kernels.attached();
        info!(
            "[coordinator] Re-injecting into {} kernel(s)",
            attached.len()
        );
        let passes = attached
            .into_iter()
            .map(|(kernel, scope)| self.full_pass(kernel, scope));
        join_all(passes).await;
    }

    /// Re-run [`reinject_all`](Self::reinject_all) whenever the active
    /// instance changes.
    pub fn spawn_instance_watcher(&self) -> JoinHandle<()> {
        let mut changes = self.inner.active.subscribe();
        let coordinator = self.clone();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let instance = changes.borrow_and_update().clone();
                match instance {
                    Some(ref instance) => info!(
                        "[coordinator] Active instance is now {}",
                        instance.name
                    ),
                    None => info!("[coordinator] Active instance cleared"),
                }
                coordinator.reinject_all().await;
            }
        })
    }

    /// Inject attachments whose variable is not bound yet, then forget
    /// names no longer declared in the notebook.
    pub async fn inject_uninjected(&self, notebook_id: &str) {
        let Some(kernel) = self.inner.kernels.kernel_for_notebook(notebook_id) else {
            debug!("[coordinator] No kernel for {}", notebook_id);
            return;
        };
        let Some(scope) = self.inner.kernels.scope(kernel.id()) else {
            return;
        };
        let Some(notebook) = self.inner.notebooks.get(notebook_id) else {
            return;
        };
        let attachments = match notebook.attachments() {
            Ok(attachments) => attachments,
            Err(e) => {
                error!("[coordinator] {}: {}", notebook_id, e);
                return;
            }
        };

        let injected = self.inner.kernels.injected(&scope.kernel_id);
        let uninjected: Vec<Attachment> = attachments
            .iter()
            .filter(|a| !injected.contains(&a.variable_name))
            .cloned()
            .collect();
        self.inject_attachments(kernel.as_ref(), &scope, &uninjected)
            .await;

        let declared: HashSet<&str> = attachments
            .iter()
            .map(|a| a.variable_name.as_str())
            .collect();
        self.inner
            .kernels
            .retain_injected(&scope.kernel_id, |name| declared.contains(name));
    }

    /// Variable names bound in the kernel.
    pub fn injected_variable_names(&self, kernel_id: &str) -> Vec<String> {
        self.inner.kernels.injected(kernel_id)
    }

    pub fn notebook_for_kernel(&self, kernel_id: &str) -> Option<String> {
        self.inner.kernels.notebook_for(kernel_id)
    }

    fn attach_kernel(&self, notebook_id: &str, kernel: Arc<dyn KernelConnection>) -> KernelScope {
        let kernel_id = kernel.id().to_string();
        let incoming = kernel.register_comm_target(FRONTEND_COMM_TARGET);
        let scope = self.inner.kernels.attach(kernel, notebook_id);

        let listener = tokio::spawn(
            self.inner
                .inbound
                .clone()
                .serve(kernel_id.clone(), incoming),
        );
        self.inner.kernels.set_listener(&kernel_id, listener);

        info!(
            "[coordinator] Kernel {} attached to {}",
            kernel_id, notebook_id
        );
        scope
    }

    /// Attach now; run the full pass on its own task so a slow lookup does
    /// not hold up later session events.
    fn spawn_attach(&self, notebook_id: &str, kernel: Arc<dyn KernelConnection>) {
        let scope = self.attach_kernel(notebook_id, kernel.clone());
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.full_pass(kernel, scope).await;
        });
    }

    async fn full_pass(&self, kernel: Arc<dyn KernelConnection>, scope: KernelScope) {
        let Some(notebook) = self.inner.notebooks.get(&scope.notebook_id) else {
            warn!("[coordinator] Notebook {} is not open", scope.notebook_id);
            return;
        };
        let attachments = match notebook.attachments() {
            Ok(attachments) => attachments,
            Err(e) => {
                error!("[coordinator] {}: {}", scope.notebook_id, e);
                Vec::new()
            }
        };
        self.inject_attachments(kernel.as_ref(), &scope, &attachments)
            .await;
    }

    async fn inject_attachments(
        &self,
        kernel: &dyn KernelConnection,
        scope: &KernelScope,
        attachments: &[Attachment],
    ) {
        if attachments.is_empty() {
            return;
        }
        let Some(instance) = self.inner.active.get() else {
            debug!("[coordinator] No active instance, skipping injection");
            return;
        };

        let injections: Vec<_> = self
            .inner
            .resolver
            .resolve_all(&instance.name, attachments, scope)
            .await
            .into_iter()
            .flatten()
            .collect();

        if !self.inner.kernels.is_current(scope) {
            debug!(
                "[coordinator] Kernel {} was reset during resolution, dropping batch",
                kernel.id()
            );
            return;
        }

        match self.inner.injection.inject(kernel, scope, &injections).await {
            Ok(()) => {
                for injection in &injections {
                    self.set_status(scope, &injection.did, ResolveStatus::Ready);
                }
            }
            Err(e) => {
                error!(
                    "[coordinator] Injection into kernel {} failed: {}",
                    kernel.id(),
                    e
                );
                for attachment in attachments {
                    self.set_status(scope, &attachment.did, ResolveStatus::Failed);
                }
            }
        }
    }

    fn set_status(&self, scope: &KernelScope, did: &str, status: ResolveStatus) {
        if self.inner.kernels.is_current(scope) {
            self.inner.status.set_status(&scope.notebook_id, did, status);
        }
    }
}
