//! Metadata fetcher for the info endpoint
//!
//! One GET per call; the text body is parsed by [`DatasetDescriptor::parse`].

use crate::config::ClientConfig;
use crate::descriptor::DatasetDescriptor;
use crate::error::{Error, Result};
use url::Url;

/// HTTP client for dataset descriptors
#[derive(Debug, Clone)]
pub struct MetadataFetcher {
    client: reqwest::Client,
}

impl MetadataFetcher {
    /// Create a fetcher honouring the config's connect and request timeouts
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Connection(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Create a fetcher that shares an existing reqwest client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetch and parse the descriptor at `info_url`
    ///
    /// # Errors
    ///
    /// * `Error::Connection` - request failed or the server answered non-2xx
    /// * `Error::Protocol` - body is not a valid descriptor
    pub async fn fetch_descriptor(&self, info_url: &Url) -> Result<DatasetDescriptor> {
        tracing::debug!("Fetching dataset info from {}", info_url);

        let response = self
            .client
            .get(info_url.clone())
            .send()
            .await
            .map_err(|e| Error::Connection(format!("Info request to {} failed: {}", info_url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::Connection(format!(
                "HTTP {} {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown"),
                error_text.trim()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::Connection(format!("Failed to read info body: {}", e)))?;

        let descriptor = DatasetDescriptor::parse(&body)?;
        tracing::info!(
            "Dataset '{}' shape={:?} dtype={:?} item_size={}",
            descriptor.name,
            descriptor.shape,
            descriptor.dtype,
            descriptor.item_size
        );
        Ok(descriptor)
    }
}
