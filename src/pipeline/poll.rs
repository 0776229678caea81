//! Client-side observation of transcription progress.

use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use super::{PipelineConfig, VisitPipeline};
use crate::core::{Cancellation, EngineError};
use crate::domain::{AudioUpload, Stage, UploadStatus};
use crate::store::uploads;

/// Bounded polling schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.poll_interval_ms),
            max_attempts: config.poll_max_attempts,
        }
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl VisitPipeline {
    /// Current upload row for a visit
    pub fn audio_status(&self, visit_id: Uuid) -> Result<AudioUpload, EngineError> {
        self.store
            .with_conn(|conn| uploads::get_upload_for_visit(conn, visit_id))?
            .ok_or_else(|| EngineError::not_found("audio upload", visit_id))
    }

    /// Wait until transcription completes, fails, runs out of checks or is cancelled.
    ///
    /// Running out of checks is a [`EngineError::PollTimeout`], distinct from
    /// a failed transcription.
    pub async fn wait_for_transcription(
        &self,
        visit_id: Uuid,
        options: PollOptions,
        cancel: &Cancellation,
    ) -> Result<AudioUpload, EngineError> {
        for attempt in 1..=options.max_attempts {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let upload = self.audio_status(visit_id)?;
            match upload.status {
                UploadStatus::Completed => return Ok(upload),
                UploadStatus::Failed => {
                    return Err(EngineError::PipelineStage {
                        stage: Stage::Transcribe,
                        visit_id,
                        message: upload
                            .error_message
                            .unwrap_or_else(|| "transcription failed".to_string()),
                    })
                }
                status => debug!(visit_id = %visit_id, attempt, status = %status, "Still transcribing"),
            }

            if attempt == options.max_attempts {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(options.interval) => {}
            }
        }

        Err(EngineError::PollTimeout {
            what: "transcription",
            attempts: options.max_attempts,
        })
    }
}
