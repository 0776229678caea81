//! Notes derived from a visit recording.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

str_enum!(NoteStatus {
    Draft => "draft",
    Finalized => "finalized",
});

/// Clinician-facing note, holding the transcript it was generated from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderNote {
    pub id: Uuid,
    pub visit_id: Uuid,
    pub transcript: Option<String>,
    pub content: Option<String>,
    pub status: NoteStatus,
    pub finalized_at: Option<DateTime<Utc>>,
    pub finalized_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Plain-language note shared with the patient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientNote {
    pub id: Uuid,
    pub visit_id: Uuid,
    pub content: Option<String>,
    pub language: String,
    pub status: NoteStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
