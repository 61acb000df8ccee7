//! Typed DID attachments and the values they resolve to.
//!
//! Attachments live in the notebook-level metadata under
//! [`METADATA_KEY`] as a JSON array:
//!
//! ```json
//! "rucio_attachments": [
//!   { "variableName": "events", "did": "user.jdoe:events.root", "type": "file" },
//!   { "variableName": "runs", "did": "user.jdoe:run2024", "type": "container" }
//! ]
//! ```
//!
//! The list is edited by the notebook UI; this crate only reads it.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{AttachError, Result};

/// Notebook metadata key holding the attachment list.
pub const METADATA_KEY: &str = "rucio_attachments";

/// Kind of data identifier an attachment points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum DidType {
    /// A single file; resolves to one path.
    File,
    /// A dataset or container; resolves to one path per contained file.
    Container,
}

impl std::fmt::Display for DidType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DidType::File => write!(f, "file"),
            DidType::Container => write!(f, "container"),
        }
    }
}

/// A declared binding of a kernel variable to a data identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Attachment {
    /// Kernel-side identifier the resolved path is bound to.
    pub variable_name: String,
    /// Data identifier, usually `scope:name`.
    pub did: String,
    #[serde(rename = "type")]
    pub did_type: DidType,
}

impl Attachment {
    pub fn file(variable_name: &str, did: &str) -> Self {
        Attachment {
            variable_name: variable_name.to_string(),
            did: did.to_string(),
            did_type: DidType::File,
        }
    }

    pub fn container(variable_name: &str, did: &str) -> Self {
        Attachment {
            variable_name: variable_name.to_string(),
            did: did.to_string(),
            did_type: DidType::Container,
        }
    }
}

/// Replication state reported by the lookup service for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    #[default]
    Ok,
    Replicating,
    NotAvailable,
    Stuck,
}

/// One file record returned by the lookup service.
///
/// An empty or missing `path` means the file is not available locally yet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileDidDetails {
    #[serde(default)]
    pub did: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default)]
    pub status: FileStatus,
}

impl FileDidDetails {
    /// Details for a file that is available at `path`.
    pub fn available(did: &str, path: &str) -> Self {
        FileDidDetails {
            did: did.to_string(),
            path: Some(path.to_string()),
            size: None,
            status: FileStatus::Ok,
        }
    }
}

/// Resolved path value: a string for files, a list for containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(untagged)]
#[ts(export)]
pub enum InjectedPath {
    Single(String),
    Multiple(Vec<String>),
}

/// The resolved unit pushed into a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct VariableInjection {
    pub variable_name: String,
    pub path: InjectedPath,
    pub did: String,
}

impl VariableInjection {
    /// Translate a file lookup result. An empty path is passed through as-is.
    pub fn from_file(attachment: &Attachment, details: FileDidDetails) -> Self {
        VariableInjection {
            variable_name: attachment.variable_name.clone(),
            path: InjectedPath::Single(details.path.unwrap_or_default()),
            did: attachment.did.clone(),
        }
    }

    /// Translate a container lookup result, dropping files without a path.
    pub fn from_container(attachment: &Attachment, details: Vec<FileDidDetails>) -> Self {
        let paths = details
            .into_iter()
            .filter_map(|d| d.path)
            .filter(|p| !p.is_empty())
            .collect();

        VariableInjection {
            variable_name: attachment.variable_name.clone(),
            path: InjectedPath::Multiple(paths),
            did: attachment.did.clone(),
        }
    }
}

/// Validate the raw metadata value stored under [`METADATA_KEY`].
///
/// `None` (key absent) and JSON `null` both mean "no attachments".
pub fn parse_attachments(value: Option<serde_json::Value>) -> Result<Vec<Attachment>> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(v) => serde_json::from_value(v).map_err(AttachError::MalformedMetadata),
    }
}
