//! Visit processing pipeline.
//!
//! Stages run strictly in order, each idempotent and individually retryable:
//!
//! 1. Upload: recording -> object storage, confirmed before the local file goes
//! 2. Transcribe: speech-to-text into the provider note
//! 3. Generate notes: clinician SOAP note plus plain-language patient note
//! 4. Finalize: human approval, magic link, patient notification
//!
//! External calls go through the shared [`Retry`] executor. When a
//! transcription or generation call exhausts it, the visit moves to `Error`
//! with the failed stage recorded, and only an explicit `retry_stage` moves
//! it back.

pub mod access;
pub mod finalize;
pub mod notes;
pub mod poll;
pub mod transcribe;
pub mod upload;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::{NotificationTransport, ObjectStorage, SpeechToText, TextGenerator};
use crate::core::{EngineError, Retry};
use crate::domain::{
    ProcessingEvent, ProcessingStatus, Role, Stage, StaffIdentity, UploadStatus, Visit,
};
use crate::store::{uploads, visits, Store};

pub use access::PatientNoteView;
pub use finalize::FinalizeOutcome;
pub use notes::GeneratedNotes;
pub use poll::PollOptions;
pub use upload::{UploadOutcome, UploadRequest};

/// Pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_poll_max_attempts")]
    pub poll_max_attempts: u32,

    #[serde(default = "default_link_expiry_days")]
    pub magic_link_expiry_days: i64,

    #[serde(default = "default_signed_url_expiry")]
    pub signed_url_expiry_secs: u64,

    /// Public site serving `/note/{token}`
    #[serde(default = "default_web_url")]
    pub web_url: String,

    #[serde(default = "default_template")]
    pub notification_template: String,

    /// Language for transcription, notes and templates
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_poll_interval() -> u64 {
    5000
}
fn default_poll_max_attempts() -> u32 {
    60
}
fn default_link_expiry_days() -> i64 {
    30
}
fn default_signed_url_expiry() -> u64 {
    3600
}
fn default_web_url() -> String {
    "https://karibu.health".to_string()
}
fn default_template() -> String {
    "patient_note_ready".to_string()
}
fn default_language() -> String {
    "en".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            poll_max_attempts: default_poll_max_attempts(),
            magic_link_expiry_days: default_link_expiry_days(),
            signed_url_expiry_secs: default_signed_url_expiry(),
            web_url: default_web_url(),
            notification_template: default_template(),
            language: default_language(),
        }
    }
}

impl PipelineConfig {
    /// Public URL of a patient note
    pub fn note_url(&self, token: &str) -> String {
        format!("{}/note/{}", self.web_url.trim_end_matches('/'), token)
    }
}

/// External collaborators of the pipeline
#[derive(Clone)]
pub struct PipelineServices {
    pub storage: Arc<dyn ObjectStorage>,
    pub transcriber: Arc<dyn SpeechToText>,
    pub generator: Arc<dyn TextGenerator>,
    pub notifier: Arc<dyn NotificationTransport>,
}

/// Sole writer of processing status, uploads and notes
#[derive(Clone)]
pub struct VisitPipeline {
    store: Arc<Store>,
    services: PipelineServices,
    retry: Retry,
    config: PipelineConfig,
}

impl VisitPipeline {
    pub fn new(
        store: Arc<Store>,
        services: PipelineServices,
        retry: Retry,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            services,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn visit(&self, visit_id: Uuid) -> Result<Visit, EngineError> {
        self.store
            .with_conn(|conn| visits::get_visit(conn, visit_id))?
            .ok_or_else(|| EngineError::not_found("visit", visit_id))
    }

    /// Load a visit of the actor's clinic; other clinics' visits do not exist
    fn visit_for(&self, actor: &StaffIdentity, visit_id: Uuid) -> Result<Visit, EngineError> {
        let visit = self.visit(visit_id)?;
        if visit.clinic_id != actor.clinic_id {
            return Err(EngineError::not_found("visit", visit_id));
        }
        Ok(visit)
    }

    /// Apply a forward processing event with compare-and-set on the current status
    fn advance(&self, visit_id: Uuid, event: ProcessingEvent) -> Result<ProcessingStatus, EngineError> {
        let sources: Vec<(ProcessingStatus, ProcessingStatus)> = ProcessingStatus::ALL
            .iter()
            .filter_map(|from| from.transition(event).ok().map(|to| (*from, to)))
            .collect();

        let current = self.visit(visit_id)?.status;
        let to = current.transition(event)?;
        let from: Vec<ProcessingStatus> = sources
            .iter()
            .filter(|(_, target)| *target == to)
            .map(|(from, _)| *from)
            .collect();

        let moved = self.store.with_conn(|conn| {
            visits::transition_processing(conn, visit_id, &from, to, Utc::now())
        })?;

        if moved {
            return Ok(to);
        }

        // Someone else moved the visit between our read and the write
        let now_status = self.visit(visit_id)?.status;
        Err(EngineError::Conflict {
            entity: "visit",
            id: visit_id,
            message: format!("moved to {} before {} could apply", now_status, event),
        })
    }

    /// Record a stage failure on the visit (and the upload for transcription)
    fn fail_stage(&self, visit_id: Uuid, stage: Stage, cause: &EngineError) -> EngineError {
        let message = cause.to_string();
        let now = Utc::now();

        let recorded = self.store.with_tx(|tx| {
            if stage == Stage::Transcribe {
                uploads::mark_upload_failed(tx, visit_id, &message, now)?;
            }
            visits::mark_failed(tx, visit_id, stage, &message, now)
        });

        match recorded {
            Ok(true) => {
                error!(visit_id = %visit_id, stage = %stage, error = %message, "Pipeline stage failed")
            }
            Ok(false) => {
                warn!(visit_id = %visit_id, stage = %stage, "Stage failed on a visit already terminal")
            }
            Err(e) => {
                error!(visit_id = %visit_id, stage = %stage, error = %e, "Failed to record stage failure")
            }
        }

        EngineError::PipelineStage {
            stage,
            visit_id,
            message,
        }
    }

    /// Explicit human retry from the recorded failed stage.
    ///
    /// Resets the visit to the stage's entry status and, for transcription
    /// and note generation, runs the remaining stages again.
    pub async fn retry_stage(
        &self,
        actor: &StaffIdentity,
        visit_id: Uuid,
    ) -> Result<Visit, EngineError> {
        let visit = self.visit_for(actor, visit_id)?;

        let stage = match (visit.status, visit.failed_stage) {
            (ProcessingStatus::Error, Some(stage)) => stage,
            (ProcessingStatus::Error, None) => {
                return Err(EngineError::validation("visit failed without a recorded stage"))
            }
            (status, _) => {
                return Err(EngineError::validation(format!(
                    "visit is {}, only failed visits can be retried",
                    status
                )))
            }
        };

        let to = visit
            .status
            .transition(ProcessingEvent::RetryFrom(stage))?;
        let now = Utc::now();

        let reset = self.store.with_tx(|tx| -> Result<bool, EngineError> {
            if stage == Stage::Transcribe {
                let upload_reset = uploads::transition_upload(
                    tx,
                    visit_id,
                    &[UploadStatus::Failed, UploadStatus::Transcribing],
                    UploadStatus::Uploaded,
                    now,
                )?;
                if !upload_reset {
                    return Err(EngineError::Conflict {
                        entity: "audio upload",
                        id: visit_id,
                        message: "is no longer failed, transcription cannot be retried".to_string(),
                    });
                }
            }
            Ok(visits::clear_failure(tx, visit_id, to, now)?)
        })?;

        if !reset {
            return Err(EngineError::Conflict {
                entity: "visit",
                id: visit_id,
                message: "was retried by someone else".to_string(),
            });
        }

        info!(
            visit_id = %visit_id,
            stage = %stage,
            actor = %actor.staff_id,
            previous_error = visit.error_message.as_deref().unwrap_or(""),
            "Retrying pipeline stage"
        );

        match stage {
            Stage::Transcribe => {
                self.process_recording(visit_id).await?;
            }
            Stage::GenerateNotes => {
                self.generate_notes(visit_id).await?;
            }
            Stage::Upload | Stage::Finalize => {}
        }

        self.visit(visit_id)
    }
}

fn require_role(
    actor: &StaffIdentity,
    roles: &[Role],
    operation: &'static str,
) -> Result<(), EngineError> {
    if actor.has_role(roles) {
        Ok(())
    } else {
        Err(EngineError::Forbidden {
            role: actor.role,
            operation,
        })
    }
}
