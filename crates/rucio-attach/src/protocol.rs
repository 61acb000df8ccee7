//! Comm message protocol between the front end and the kernel.
//!
//! Two independent comm targets are used:
//! - [`KERNEL_COMM_TARGET`]: opened by the front end to push an `inject`
//!   batch; the kernel binds each variable and closes the comm.
//! - [`FRONTEND_COMM_TARGET`]: opened by the kernel to ask for a re-send
//!   (`request-inject`) or report variables it restored itself (`ack-inject`).
//!
//! Messages are JSON objects tagged by `action`.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::attachment::VariableInjection;

/// Comm target the front end opens on the kernel.
pub const KERNEL_COMM_TARGET: &str = "rucio.kernel";

/// Comm target the kernel opens on the front end.
pub const FRONTEND_COMM_TARGET: &str = "rucio.frontend";

/// Messages sent by the front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "action", rename_all = "kebab-case")]
#[ts(export)]
pub enum KernelMessage {
    /// Bind every `variableName` to its resolved path.
    Inject { dids: Vec<VariableInjection> },
}

/// Messages sent by the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "action", rename_all = "kebab-case")]
#[ts(export)]
pub enum FrontendMessage {
    /// Resolve and re-send every attachment of the owning notebook.
    RequestInject,
    /// The kernel bound these variables itself.
    AckInject { variable_names: Vec<String> },
}

impl KernelMessage {
    /// Serialize as comm `data`.
    pub fn to_data(&self) -> serde_json::Value {
        // Serializing plain strings and vectors cannot fail
        serde_json::to_value(self).unwrap_or_default()
    }
}

impl FrontendMessage {
    /// Parse comm `data`. Unknown actions are an error.
    pub fn from_data(data: &serde_json::Value) -> serde_json::Result<Self> {
        FrontendMessage::deserialize(data)
    }
}
