//! rucio-attach - Injects Rucio DID attachments into live Jupyter kernels.
//!
//! A notebook declares attachments (variable name, DID, file or container)
//! in its metadata. When a kernel attaches, each attachment is resolved to
//! local replica paths through the lookup service and pushed into the kernel
//! over a comm channel, where the kernel-side extension binds the variables.
//!
//! The [`KernelLifecycleCoordinator`] ties it together: it follows notebook
//! session events, re-injects after configuration changes, and answers
//! kernel-initiated `request-inject` / `ack-inject` messages. Per-DID
//! progress is published through the [`StatusRegistry`].

pub mod attachment;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod inbound;
pub mod injection;
pub mod jupyter;
pub mod kernel;
pub mod kernels;
pub mod lookup;
pub mod notebook;
pub mod protocol;
pub mod resolver;
pub mod status;

#[cfg(test)]
mod testing;

pub use attachment::{Attachment, DidType, FileDidDetails, VariableInjection};
pub use config::{ActiveInstance, AttachConfig, Instance};
pub use coordinator::KernelLifecycleCoordinator;
pub use error::{AttachError, Result};
pub use kernel::{Comm, IncomingComm, KernelConnection};
pub use lookup::{DidLookup, HttpDidLookup};
pub use notebook::{IpynbNotebook, KernelStatus, NotebookDocument, SessionEvent};
pub use status::{ResolveStatus, StatusRegistry};
