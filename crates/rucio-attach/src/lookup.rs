//! DID metadata lookup.
//!
//! Resolution goes through the Jupyter server extension, which knows how
//! each Rucio instance maps replicas onto local storage. Results are never
//! cached here: every resolution asks again.

use async_trait::async_trait;
use log::debug;

use crate::attachment::FileDidDetails;
use crate::error::{AttachError, Result};

/// Lookup service for DID file details.
#[async_trait]
pub trait DidLookup: Send + Sync {
    /// Details of a single file DID.
    async fn lookup_file(&self, instance: &str, did: &str) -> Result<FileDidDetails>;

    /// Details of every file in a dataset or container DID, in order.
    async fn lookup_container(&self, instance: &str, did: &str) -> Result<Vec<FileDidDetails>>;
}

/// HTTP client for the server extension's `files` endpoint.
pub struct HttpDidLookup {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpDidLookup {
    /// `base_url` is the Jupyter server root, e.g. `http://localhost:8888`.
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Endpoint URL for the file listing.
    pub fn files_url(&self) -> String {
        format!("{}/rucio-jupyterlab/files", self.base_url)
    }

    async fn fetch_files(&self, instance: &str, did: &str) -> Result<Vec<FileDidDetails>> {
        debug!("[lookup] GET files namespace={} did={}", instance, did);

        let mut request = self
            .client
            .get(self.files_url())
            .query(&[("namespace", instance), ("did", did), ("poll", "0")]);
        if let Some(ref token) = self.token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("token {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttachError::lookup(did, format!("{}: {}", status, body.trim())));
        }

        Ok(response.json::<Vec<FileDidDetails>>().await?)
    }
}

#[async_trait]
impl DidLookup for HttpDidLookup {
    async fn lookup_file(&self, instance: &str, did: &str) -> Result<FileDidDetails> {
        self.fetch_files(instance, did)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AttachError::lookup(did, "no file details returned"))
    }

    async fn lookup_container(&self, instance: &str, did: &str) -> Result<Vec<FileDidDetails>> {
        self.fetch_files(instance, did).await
    }
}
