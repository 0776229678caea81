//! Object storage REST client for audio recordings.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{check_response, http_client, transport_error, ObjectStorage};
use crate::core::EngineError;

const SERVICE: &str = "storage";

/// Configuration for the storage client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Service base URL, e.g. `https://project.example.co`
    pub base_url: String,

    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Service key (from `STORAGE_SERVICE_KEY`, never from the file)
    #[serde(skip)]
    pub service_key: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_bucket() -> String {
    "audio-recordings".to_string()
}

fn default_timeout() -> u64 {
    120
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            bucket: default_bucket(),
            service_key: None,
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    url: String,
}

/// Storage API client
pub struct StorageClient {
    config: StorageConfig,
    client: reqwest::Client,
}

impl StorageClient {
    pub fn new(config: StorageConfig) -> Result<Self, EngineError> {
        if config.base_url.is_empty() {
            return Err(EngineError::validation("storage base_url is not configured"));
        }
        let client = http_client(Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, client })
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.bucket,
            path.trim_start_matches('/')
        )
    }

    fn sign_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/upload/sign/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.bucket,
            path.trim_start_matches('/')
        )
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.service_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStorage for StorageClient {
    async fn signed_upload_url(
        &self,
        path: &str,
        expires_in: Duration,
    ) -> Result<String, EngineError> {
        let response = self
            .authorized(self.client.post(self.sign_url(path)))
            .json(&serde_json::json!({ "expiresIn": expires_in.as_secs() }))
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let signed: SignedUrlResponse = check_response(SERVICE, response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        // The service answers with a path relative to /storage/v1
        let url = if signed.url.starts_with("http") {
            signed.url
        } else {
            format!(
                "{}/storage/v1{}",
                self.config.base_url.trim_end_matches('/'),
                signed.url
            )
        };

        debug!(path, "Issued signed upload URL");
        Ok(url)
    }

    async fn upload(
        &self,
        signed_url: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), EngineError> {
        let size = bytes.len();
        let response = self
            .client
            .put(signed_url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        check_response(SERVICE, response).await?;
        debug!(size_bytes = size, "Uploaded object");
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, EngineError> {
        let response = self
            .authorized(self.client.get(self.object_url(path)))
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let bytes = check_response(SERVICE, response)
            .await?
            .bytes()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        Ok(bytes.to_vec())
    }
}
