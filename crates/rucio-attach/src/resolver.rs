//! Turns declared attachments into concrete variable injections.
//!
//! Every attachment is looked up independently and concurrently. A failed
//! lookup marks that DID `FAILED` and yields `None` in its position; it never
//! aborts its siblings.

use std::sync::Arc;

use futures::future::join_all;
use log::{debug, error};

use crate::attachment::{Attachment, DidType, VariableInjection};
use crate::error::Result;
use crate::kernels::{KernelScope, KernelTable};
use crate::lookup::DidLookup;
use crate::status::{ResolveStatus, StatusRegistry};

pub struct AttachmentResolver {
    lookup: Arc<dyn DidLookup>,
    status: Arc<StatusRegistry>,
    kernels: Arc<KernelTable>,
}

impl AttachmentResolver {
    pub fn new(
        lookup: Arc<dyn DidLookup>,
        status: Arc<StatusRegistry>,
        kernels: Arc<KernelTable>,
    ) -> Self {
        Self {
            lookup,
            status,
            kernels,
        }
    }

    /// Resolve every attachment against `instance`.
    ///
    /// The result has one slot per attachment, in input order; failed
    /// lookups are `None`. Status writes are dropped once `scope` is stale.
    pub async fn resolve_all(
        &self,
        instance: &str,
        attachments: &[Attachment],
        scope: &KernelScope,
    ) -> Vec<Option<VariableInjection>> {
        let resolutions = attachments.iter().map(|attachment| {
            self.resolve_one(instance, attachment, &scope.notebook_id, Some(scope))
        });
        join_all(resolutions).await
    }

    /// Like [`resolve_all`](Self::resolve_all), for a notebook with no kernel.
    pub async fn resolve_for_notebook(
        &self,
        instance: &str,
        attachments: &[Attachment],
        notebook_id: &str,
    ) -> Vec<Option<VariableInjection>> {
        let resolutions = attachments
            .iter()
            .map(|attachment| self.resolve_one(instance, attachment, notebook_id, None));
        join_all(resolutions).await
    }

    async fn resolve_one(
        &self,
        instance: &str,
        attachment: &Attachment,
        notebook_id: &str,
        scope: Option<&KernelScope>,
    ) -> Option<VariableInjection> {
        self.set_status(notebook_id, scope, &attachment.did, ResolveStatus::Resolving);

        match self.lookup(instance, attachment).await {
            Ok(injection) => {
                debug!(
                    "[resolver] Resolved {} ({}) for {}",
                    attachment.did, attachment.did_type, attachment.variable_name
                );
                self.set_status(
                    notebook_id,
                    scope,
                    &attachment.did,
                    ResolveStatus::PendingInjection,
                );
                Some(injection)
            }
            Err(e) => {
                error!("[resolver] Failed to resolve {}: {}", attachment.did, e);
                self.set_status(notebook_id, scope, &attachment.did, ResolveStatus::Failed);
                None
            }
        }
    }

    async fn lookup(&self, instance: &str, attachment: &Attachment) -> Result<VariableInjection> {
        match attachment.did_type {
            DidType::File => {
                let details = self.lookup.lookup_file(instance, &attachment.did).await?;
                Ok(VariableInjection::from_file(attachment, details))
            }
            DidType::Container => {
                let details = self
                    .lookup
                    .lookup_container(instance, &attachment.did)
                    .await?;
                Ok(VariableInjection::from_container(attachment, details))
            }
        }
    }

    fn set_status(
        &self,
        notebook_id: &str,
        scope: Option<&KernelScope>,
        did: &str,
        status: ResolveStatus,
    ) {
        match scope {
            Some(scope) if !self.kernels.is_current(scope) => debug!(
                "[resolver] Dropping stale {} for {} (kernel {})",
                status, did, scope.kernel_id
            ),
            _ => self.status.set_status(notebook_id, did, status),
        }
    }
}
