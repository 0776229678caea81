//! Audio upload attached 1:1 to a visit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

str_enum!(UploadStatus {
    Pending => "pending",
    Uploading => "uploading",
    Uploaded => "uploaded",
    Transcribing => "transcribing",
    Completed => "completed",
    Failed => "failed",
});

impl UploadStatus {
    /// Storage holds the recording (confirmation already happened)
    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Uploaded | Self::Transcribing | Self::Completed)
    }
}

/// The recording of a visit, keyed by visit id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioUpload {
    pub id: Uuid,
    pub visit_id: Uuid,

    /// Object-storage key, set on confirmation
    pub storage_path: Option<String>,

    pub duration_seconds: Option<f64>,
    pub file_size_bytes: Option<i64>,
    pub mime_type: String,
    pub status: UploadStatus,
    pub error_message: Option<String>,

    pub uploaded_at: Option<DateTime<Utc>>,
    pub transcription_started_at: Option<DateTime<Utc>>,
    pub transcription_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Unique storage key for one upload attempt: `{clinic}/{visit}/{millis}.m4a`
pub fn storage_path_for(clinic_id: Uuid, visit_id: Uuid, at: DateTime<Utc>) -> String {
    format!("{}/{}/{}.m4a", clinic_id, visit_id, at.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_storage_path_layout() {
        let clinic = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
        let visit = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();

        assert_eq!(
            storage_path_for(clinic, visit, at),
            "00000000-0000-0000-0000-000000000001/550e8400-e29b-41d4-a716-446655440000/1700000000123.m4a"
        );
    }

    #[test]
    fn test_accepted_statuses() {
        assert!(!UploadStatus::Pending.is_accepted());
        assert!(!UploadStatus::Uploading.is_accepted());
        assert!(UploadStatus::Uploaded.is_accepted());
        assert!(UploadStatus::Completed.is_accepted());
        assert!(!UploadStatus::Failed.is_accepted());
    }
}
