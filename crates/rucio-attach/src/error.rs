//! Error type for attachment resolution and injection.

/// Errors produced by the attachment layer.
///
/// Coordinator-level operations catch these at their boundary and fold them
/// into [`ResolveStatus`](crate::status::ResolveStatus) values; they only
/// reach callers of the lower-level building blocks.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("Lookup failed for {did}: {message}")]
    Lookup { did: String, message: String },

    #[error("Comm channel error: {0}")]
    Channel(String),

    #[error("Malformed attachment metadata: {0}")]
    MalformedMetadata(#[source] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl AttachError {
    /// Build a lookup failure for `did`.
    pub fn lookup(did: &str, message: impl std::fmt::Display) -> Self {
        AttachError::Lookup {
            did: did.to_string(),
            message: message.to_string(),
        }
    }

    /// Build a comm channel failure.
    pub fn channel(message: impl std::fmt::Display) -> Self {
        AttachError::Channel(message.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AttachError>;
