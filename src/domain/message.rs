//! Outbound patient notification log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

str_enum!(MessageStatus {
    Sent => "sent",
    Failed => "failed",
});

str_enum!(
    /// Which message shape reached (or failed to reach) the patient
    MessageVariant {
        Template => "template",
        Text => "text",
    }
);

/// One notification attempt, recorded whatever the outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLog {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub visit_id: Uuid,
    pub channel: String,
    pub message_type: String,
    pub variant: MessageVariant,
    pub status: MessageStatus,
    pub external_id: Option<String>,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
