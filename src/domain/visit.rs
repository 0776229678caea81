//! Visit state and its two independent state machines.
//!
//! `processing_status` tracks the recording → notes pipeline, `queue_status`
//! tracks the human workflow through the clinic. Each axis has exactly one
//! writer (pipeline and queue engine respectively).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TransitionError;

str_enum!(
    /// Recording / upload / AI-pipeline stage of a visit
    ProcessingStatus {
        Recording => "recording",
        Uploading => "uploading",
        Processing => "processing",
        Review => "review",
        Sent => "sent",
        Completed => "completed",
        Error => "error",
    }
);

str_enum!(
    /// Human-workflow stage of a visit
    QueueStatus {
        Waiting => "waiting",
        WithNurse => "with_nurse",
        ReadyForDoctor => "ready_for_doctor",
        WithDoctor => "with_doctor",
        Completed => "completed",
        Cancelled => "cancelled",
    }
);

str_enum!(Priority {
    Low => "low",
    Normal => "normal",
    High => "high",
    Urgent => "urgent",
});

str_enum!(
    /// Pipeline stage, used to scope a human-triggered retry
    Stage {
        Upload => "upload",
        Transcribe => "transcribe",
        GenerateNotes => "generate_notes",
        Finalize => "finalize",
    }
);

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    /// Sort key, higher is more urgent
    pub fn rank(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Urgent => 3,
        }
    }
}

/// Events accepted by the processing state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingEvent {
    /// Client began transferring the recording
    StartUpload,
    /// Storage confirmed the recording
    ConfirmUpload,
    /// Both notes were generated
    NotesReady,
    /// Staff approved the notes (re-finalizing re-issues the patient link)
    Finalize,
    /// Patient opened the note for the first time
    PatientOpened,
    /// A stage exhausted its retries
    Fail,
    /// Explicit human retry from a failed stage
    RetryFrom(Stage),
}

impl std::fmt::Display for ProcessingEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StartUpload => f.write_str("start_upload"),
            Self::ConfirmUpload => f.write_str("confirm_upload"),
            Self::NotesReady => f.write_str("notes_ready"),
            Self::Finalize => f.write_str("finalize"),
            Self::PatientOpened => f.write_str("patient_opened"),
            Self::Fail => f.write_str("fail"),
            Self::RetryFrom(stage) => write!(f, "retry_from({})", stage),
        }
    }
}

impl ProcessingStatus {
    /// Position along the forward path; `None` for `Error`
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Recording => Some(0),
            Self::Uploading => Some(1),
            Self::Processing => Some(2),
            Self::Review => Some(3),
            Self::Sent => Some(4),
            Self::Completed => Some(5),
            Self::Error => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Whether this status is at or beyond `other` on the forward path
    pub fn has_reached(self, other: ProcessingStatus) -> bool {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => a >= b,
            _ => false,
        }
    }

    /// Pure transition function for the processing axis
    pub fn transition(self, event: ProcessingEvent) -> Result<Self, TransitionError> {
        use ProcessingEvent as E;
        use ProcessingStatus as S;

        let next = match (self, event) {
            (S::Recording | S::Uploading, E::StartUpload) => S::Uploading,
            (S::Uploading, E::ConfirmUpload) => S::Processing,
            (S::Processing, E::NotesReady) => S::Review,
            (S::Review | S::Sent, E::Finalize) => S::Sent,
            (S::Sent, E::PatientOpened) => S::Completed,
            (s, E::Fail) if !s.is_terminal() => S::Error,
            (S::Error, E::RetryFrom(stage)) => match stage {
                Stage::Upload => S::Uploading,
                Stage::Transcribe | Stage::GenerateNotes => S::Processing,
                Stage::Finalize => S::Review,
            },
            _ => {
                return Err(TransitionError {
                    from: self.as_str(),
                    event: event.to_string(),
                })
            }
        };

        Ok(next)
    }
}

/// Events accepted by the queue state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    AssignNurse,
    ReadyForDoctor,
    ClaimByDoctor,
    Complete,
    Cancel,
}

impl std::fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AssignNurse => "assign_nurse",
            Self::ReadyForDoctor => "ready_for_doctor",
            Self::ClaimByDoctor => "claim_by_doctor",
            Self::Complete => "complete",
            Self::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

impl QueueStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Pure transition function for the queue axis
    pub fn transition(self, event: QueueEvent) -> Result<Self, TransitionError> {
        use QueueEvent as E;
        use QueueStatus as S;

        let next = match (self, event) {
            (S::Waiting, E::AssignNurse) => S::WithNurse,
            (S::WithNurse, E::ReadyForDoctor) => S::ReadyForDoctor,
            (S::ReadyForDoctor, E::ClaimByDoctor) => S::WithDoctor,
            (s, E::Complete) if !s.is_terminal() => S::Completed,
            (s, E::Cancel) if !s.is_terminal() => S::Cancelled,
            _ => {
                return Err(TransitionError {
                    from: self.as_str(),
                    event: event.to_string(),
                })
            }
        };

        Ok(next)
    }

    /// Every state from which `event` is legal, with the state it leads to
    pub fn legal_sources(event: QueueEvent) -> Vec<(QueueStatus, QueueStatus)> {
        Self::ALL
            .iter()
            .filter_map(|from| from.transition(event).ok().map(|to| (*from, to)))
            .collect()
    }

    /// Board ordering of active stages
    pub fn board_order(self) -> u8 {
        match self {
            Self::Waiting => 0,
            Self::WithNurse => 1,
            Self::ReadyForDoctor => 2,
            Self::WithDoctor => 3,
            Self::Completed => 4,
            Self::Cancelled => 5,
        }
    }
}

/// Free-text clinical fields entered by the doctor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalFields {
    pub diagnosis: Option<String>,
    pub medications: Option<String>,
    pub follow_up_instructions: Option<String>,
    pub tests_ordered: Option<String>,
}

impl ClinicalFields {
    /// Context lines fed to note generation (empty fields are skipped)
    pub fn context_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let fields = [
            ("Diagnosis", &self.diagnosis),
            ("Medications", &self.medications),
            ("Follow-up", &self.follow_up_instructions),
            ("Tests ordered", &self.tests_ordered),
        ];

        for (label, value) in fields {
            if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                lines.push(format!("{}: {}", label, v));
            }
        }

        lines
    }
}

/// One clinical encounter from check-in to patient notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visit {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub patient_id: Uuid,
    pub nurse_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,

    /// Pipeline axis
    pub status: ProcessingStatus,

    /// Workflow axis
    pub queue_status: QueueStatus,

    /// Ticket number assigned at check-in (display only)
    pub queue_position: Option<i64>,

    pub priority: Priority,
    pub chief_complaint: Option<String>,

    #[serde(flatten)]
    pub clinical: ClinicalFields,

    /// Clinic-local calendar day of the visit
    pub visit_date: NaiveDate,

    pub checked_in_at: DateTime<Utc>,
    pub consent_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,

    /// Set while `status == Error`
    pub error_message: Option<String>,
    pub error_at: Option<DateTime<Utc>>,
    pub failed_stage: Option<Stage>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Visit {
    /// Minutes spent waiting, only meaningful while still `Waiting`
    pub fn wait_minutes(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.queue_status != QueueStatus::Waiting {
            return None;
        }
        Some((now - self.checked_in_at).num_minutes().max(0))
    }

    pub fn has_consent(&self) -> bool {
        self.consent_at.is_some()
    }
}
