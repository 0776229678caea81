//! Adapter interfaces for external services.
//!
//! The pipeline talks to object storage, speech-to-text, a text generator
//! and a notification transport only through these traits, so tests can
//! substitute scripted fakes.

pub mod openai;
pub mod storage;
pub mod whatsapp;

use std::time::Duration;

use async_trait::async_trait;

use crate::core::EngineError;

pub use openai::{OpenAiClient, OpenAiConfig};
pub use storage::{StorageClient, StorageConfig};
pub use whatsapp::{WhatsAppClient, WhatsAppConfig};

/// Output from a text generation call
#[derive(Debug, Clone)]
pub struct AdapterOutput {
    /// The generated content
    pub content: String,

    /// Tokens used (if available)
    pub tokens_used: Option<u64>,
}

impl AdapterOutput {
    /// Create a new adapter output with just content
    pub fn new(content: String) -> Self {
        Self {
            content,
            tokens_used: None,
        }
    }
}

/// Blob storage for recordings
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Pre-authorised URL the client can `PUT` the object to
    async fn signed_upload_url(&self, path: &str, expires_in: Duration)
        -> Result<String, EngineError>;

    /// Transfer bytes to a URL from `signed_upload_url`
    async fn upload(&self, signed_url: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<(), EngineError>;

    async fn download(&self, path: &str) -> Result<Vec<u8>, EngineError>;
}

/// Audio transcription
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        language: &str,
    ) -> Result<String, EngineError>;
}

/// A single prompt for the text generator
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Note generation backend
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<AdapterOutput, EngineError>;
}

/// A pre-approved template message
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateMessage {
    pub to: String,
    pub template: String,
    pub language: String,
    pub body_params: Vec<String>,
    pub button_param: Option<String>,
}

/// Transport acknowledgement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageReceipt {
    pub external_id: Option<String>,
}

/// Patient messaging channel
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Channel name recorded in message logs
    fn channel(&self) -> &str;

    async fn send_template(&self, message: &TemplateMessage) -> Result<MessageReceipt, EngineError>;

    async fn send_text(&self, to: &str, body: &str) -> Result<MessageReceipt, EngineError>;
}

const MAX_ERROR_BODY: usize = 500;

/// Map an HTTP status to the error taxonomy: 5xx, 408 and 429 are transient
pub fn classify_status(service: &'static str, status: u16, body: &str) -> EngineError {
    let message: String = body.chars().take(MAX_ERROR_BODY).collect();
    if status >= 500 || status == 408 || status == 429 {
        EngineError::transient(format!("{} HTTP {}: {}", service, status, message))
    } else {
        EngineError::Rejected {
            service,
            status,
            message,
        }
    }
}

/// Pass successful responses through, classify the rest
pub(crate) async fn check_response(
    service: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(service, status.as_u16(), &body))
}

/// Network-level failures (connect, timeout, body) are transient
pub(crate) fn transport_error(service: &'static str, error: reqwest::Error) -> EngineError {
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        EngineError::transient(format!("{} request failed: {}", service, error))
    } else {
        EngineError::Rejected {
            service,
            status: error.status().map(|s| s.as_u16()).unwrap_or(0),
            message: error.to_string(),
        }
    }
}

/// Build a shared HTTP client with a request timeout
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, EngineError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| EngineError::validation(format!("Failed to build HTTP client: {}", e)))
}
