//! WhatsApp Cloud API transport for patient notifications.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    check_response, http_client, transport_error, MessageReceipt, NotificationTransport,
    TemplateMessage,
};
use crate::core::EngineError;

const SERVICE: &str = "whatsapp";

/// Configuration for the WhatsApp client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default = "default_graph_url")]
    pub graph_url: String,

    #[serde(default)]
    pub phone_number_id: String,

    /// Access token (from `WHATSAPP_ACCESS_TOKEN`, never from the file)
    #[serde(skip)]
    pub access_token: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_graph_url() -> String {
    "https://graph.facebook.com/v18.0".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            graph_url: default_graph_url(),
            phone_number_id: String::new(),
            access_token: None,
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

/// WhatsApp Cloud API client
pub struct WhatsAppClient {
    config: WhatsAppConfig,
    client: reqwest::Client,
}

impl WhatsAppClient {
    pub fn new(config: WhatsAppConfig) -> Result<Self, EngineError> {
        if config.phone_number_id.is_empty() {
            return Err(EngineError::validation("whatsapp phone_number_id is not configured"));
        }
        if config.access_token.is_none() {
            return Err(EngineError::validation("WHATSAPP_ACCESS_TOKEN is not set"));
        }
        let client = http_client(Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, client })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/messages",
            self.config.graph_url.trim_end_matches('/'),
            self.config.phone_number_id
        )
    }

    async fn post(&self, payload: serde_json::Value) -> Result<MessageReceipt, EngineError> {
        let response = self
            .client
            .post(self.messages_url())
            .bearer_auth(self.config.access_token.as_deref().unwrap_or_default())
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let sent: SendResponse = check_response(SERVICE, response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        Ok(MessageReceipt {
            external_id: sent.messages.into_iter().next().map(|m| m.id),
        })
    }
}

/// The API wants the number without its leading `+`
fn recipient(phone: &str) -> String {
    phone.trim_start_matches('+').to_string()
}

fn template_payload(message: &TemplateMessage) -> serde_json::Value {
    let body: Vec<serde_json::Value> = message
        .body_params
        .iter()
        .map(|p| json!({ "type": "text", "text": p }))
        .collect();

    let mut components = vec![json!({ "type": "body", "parameters": body })];
    if let Some(param) = &message.button_param {
        components.push(json!({
            "type": "button",
            "sub_type": "url",
            "index": "0",
            "parameters": [{ "type": "text", "text": param }],
        }));
    }

    json!({
        "messaging_product": "whatsapp",
        "to": recipient(&message.to),
        "type": "template",
        "template": {
            "name": message.template,
            "language": { "code": message.language },
            "components": components,
        },
    })
}

fn text_payload(to: &str, body: &str) -> serde_json::Value {
    json!({
        "messaging_product": "whatsapp",
        "to": recipient(to),
        "type": "text",
        "text": { "body": body },
    })
}

#[async_trait]
impl NotificationTransport for WhatsAppClient {
    fn channel(&self) -> &str {
        "whatsapp"
    }

    async fn send_template(&self, message: &TemplateMessage) -> Result<MessageReceipt, EngineError> {
        self.post(template_payload(message)).await
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<MessageReceipt, EngineError> {
        self.post(text_payload(to, body)).await
    }
}
