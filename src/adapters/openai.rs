//! OpenAI client: Whisper transcription and chat completions.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    check_response, http_client, transport_error, AdapterOutput, GenerationRequest, SpeechToText,
    TextGenerator,
};
use crate::core::EngineError;

const SERVICE: &str = "openai";

/// Configuration for the OpenAI client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,

    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    /// API key (from `OPENAI_API_KEY`, never from the file)
    #[serde(skip)]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_transcription_model() -> String {
    "whisper-1".to_string()
}
fn default_chat_model() -> String {
    "gpt-4-turbo-preview".to_string()
}
fn default_timeout() -> u64 {
    120
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            transcription_model: default_transcription_model(),
            chat_model: default_chat_model(),
            api_key: None,
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: u64,
}

/// OpenAI API client
pub struct OpenAiClient {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, EngineError> {
        if config.api_key.is_none() {
            return Err(EngineError::validation("OPENAI_API_KEY is not set"));
        }
        let client = http_client(Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, client })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    fn api_key(&self) -> &str {
        self.config.api_key.as_deref().unwrap_or_default()
    }
}

#[async_trait]
impl SpeechToText for OpenAiClient {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        language: &str,
    ) -> Result<String, EngineError> {
        let size = audio.len();
        let file_part = Part::bytes(audio)
            .file_name(file_name.to_string())
            .mime_str("audio/m4a")
            .map_err(|e| transport_error(SERVICE, e))?;

        let form = Form::new()
            .part("file", file_part)
            .text("model", self.config.transcription_model.clone())
            .text("language", language.to_string())
            .text("response_format", "text");

        let response = self
            .client
            .post(self.api_url("audio/transcriptions"))
            .bearer_auth(self.api_key())
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let transcript = check_response(SERVICE, response)
            .await?
            .text()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        debug!(audio_bytes = size, transcript_chars = transcript.len(), "Transcribed audio");

        let transcript = transcript.trim().to_string();
        if transcript.is_empty() {
            return Err(EngineError::Rejected {
                service: SERVICE,
                status: 200,
                message: "empty transcript".to_string(),
            });
        }
        Ok(transcript)
    }
}

#[async_trait]
impl TextGenerator for OpenAiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<AdapterOutput, EngineError> {
        let body = ChatRequest {
            model: &self.config.chat_model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .client
            .post(self.api_url("chat/completions"))
            .bearer_auth(self.api_key())
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let parsed: ChatResponse = check_response(SERVICE, response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| EngineError::Rejected {
                service: SERVICE,
                status: 200,
                message: "completion had no content".to_string(),
            })?;

        Ok(AdapterOutput {
            content,
            tokens_used: parsed.usage.map(|u| u.total_tokens),
        })
    }
}
