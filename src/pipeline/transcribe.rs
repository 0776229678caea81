//! Stage 2: speech-to-text.

use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::VisitPipeline;
use crate::core::EngineError;
use crate::domain::{ProcessingStatus, Stage, UploadStatus};
use crate::store::{notes, uploads};

impl VisitPipeline {
    /// Transcribe the confirmed recording into the provider note.
    ///
    /// Gated on the upload moving `Uploaded -> Transcribing`, so a second
    /// concurrent run loses instead of calling the service twice. A completed
    /// upload returns the stored transcript.
    #[instrument(skip(self), fields(visit_id = %visit_id))]
    pub async fn transcribe(&self, visit_id: Uuid) -> Result<String, EngineError> {
        let upload = self
            .store
            .with_conn(|conn| uploads::get_upload_for_visit(conn, visit_id))?
            .ok_or_else(|| EngineError::not_found("audio upload", visit_id))?;

        if upload.status == UploadStatus::Completed {
            let stored = self
                .store
                .with_conn(|conn| notes::get_provider_note(conn, visit_id))?
                .and_then(|note| note.transcript);
            if let Some(transcript) = stored {
                return Ok(transcript);
            }
        }

        let visit = self.visit(visit_id)?;
        if visit.status != ProcessingStatus::Processing {
            return Err(EngineError::validation(format!(
                "visit is {}, transcription runs while processing",
                visit.status
            )));
        }

        let storage_path = upload
            .storage_path
            .clone()
            .ok_or_else(|| EngineError::validation("upload has no storage path"))?;

        let started = self.store.with_conn(|conn| {
            uploads::transition_upload(
                conn,
                visit_id,
                &[UploadStatus::Uploaded],
                UploadStatus::Transcribing,
                Utc::now(),
            )
        })?;
        if !started {
            let current = self
                .store
                .with_conn(|conn| uploads::get_upload_for_visit(conn, visit_id))?
                .map(|u| u.status);
            return Err(match current {
                Some(UploadStatus::Transcribing) => EngineError::Conflict {
                    entity: "upload",
                    id: visit_id,
                    message: "is already being transcribed".to_string(),
                },
                Some(status) => EngineError::validation(format!(
                    "upload is {}, not ready for transcription",
                    status
                )),
                None => EngineError::not_found("audio upload", visit_id),
            });
        }

        let storage = &self.services.storage;
        let transcriber = &self.services.transcriber;
        let path = storage_path.as_str();
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let language = self.config.language.as_str();

        let result = self
            .retry
            .execute("transcribe recording", || async move {
                let audio = storage.download(path).await?;
                transcriber.transcribe(audio, file_name, language).await
            })
            .await;

        let transcript = match result {
            Ok(transcript) => transcript,
            Err(e) => return Err(self.fail_stage(visit_id, Stage::Transcribe, &e)),
        };

        let now = Utc::now();
        let saved: Result<(), EngineError> = self.store.with_tx(|tx| {
            notes::save_transcript(tx, visit_id, &transcript, now)?;
            let completed = uploads::transition_upload(
                tx,
                visit_id,
                &[UploadStatus::Transcribing],
                UploadStatus::Completed,
                now,
            )?;
            if completed {
                Ok(())
            } else {
                Err(EngineError::Conflict {
                    entity: "upload",
                    id: visit_id,
                    message: "left transcribing before the transcript was saved".to_string(),
                })
            }
        });

        match saved {
            Ok(()) => {}
            // Another actor owns the upload now; the rolled back save left nothing torn
            Err(e @ EngineError::Conflict { .. }) => return Err(e),
            Err(e) => return Err(self.fail_stage(visit_id, Stage::Transcribe, &e)),
        }

        info!(transcript_chars = transcript.len(), "Transcription complete");
        Ok(transcript)
    }
}
