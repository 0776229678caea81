//! Stage 1: recording upload and confirmation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::VisitPipeline;
use crate::core::EngineError;
use crate::domain::{
    storage_path_for, AudioUpload, ProcessingEvent, ProcessingStatus, StaffIdentity,
    UploadStatus, Visit,
};
use crate::store::{uploads, visits, StoreError};

const AUDIO_MIME: &str = "audio/m4a";

/// A finished local recording waiting to go to storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub visit_id: Uuid,
    pub local_path: PathBuf,
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum UploadOutcome {
    Uploaded {
        storage_path: String,
        size_bytes: i64,
    },
    /// Confirmed by an earlier run; only the local file was cleaned up
    AlreadyUploaded,
}

impl VisitPipeline {
    /// Stamp patient consent to record; repeated calls keep the first time
    pub fn record_consent(
        &self,
        actor: &StaffIdentity,
        visit_id: Uuid,
    ) -> Result<Visit, EngineError> {
        self.visit_for(actor, visit_id)?;
        self.store
            .with_conn(|conn| visits::record_consent(conn, visit_id, Utc::now()))?;
        info!(visit_id = %visit_id, actor = %actor.staff_id, "Consent recorded");
        self.visit(visit_id)
    }

    /// Upload a local recording and confirm it.
    ///
    /// The local file is removed only once the upload is confirmed. A failed
    /// transfer marks the upload row failed and leaves the visit in
    /// `Uploading`, so the same request can simply be issued again.
    #[instrument(skip(self, actor, request), fields(visit_id = %request.visit_id))]
    pub async fn upload_audio(
        &self,
        actor: &StaffIdentity,
        request: &UploadRequest,
    ) -> Result<UploadOutcome, EngineError> {
        let visit_id = request.visit_id;
        let visit = self.visit_for(actor, visit_id)?;

        if !visit.has_consent() {
            return Err(EngineError::validation(
                "patient consent to record has not been given",
            ));
        }

        let existing = self
            .store
            .with_conn(|conn| uploads::get_upload_for_visit(conn, visit_id))?;
        if existing.as_ref().is_some_and(|u| u.status.is_accepted()) {
            info!("Recording already uploaded, removing local copy");
            remove_local(&request.local_path).await;
            return Ok(UploadOutcome::AlreadyUploaded);
        }

        // Nothing is written unless the visit can take the upload
        if visit.status != ProcessingStatus::Uploading {
            visit.status.transition(ProcessingEvent::StartUpload)?;
        }

        let bytes = match tokio::fs::read(&request.local_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::validation("Recording file not found"))
            }
            Err(e) => return Err(e.into()),
        };
        let size_bytes = bytes.len() as i64;

        let now = Utc::now();
        let storage_path = storage_path_for(visit.clinic_id, visit_id, now);

        let pending = AudioUpload {
            id: existing.as_ref().map(|u| u.id).unwrap_or_else(Uuid::new_v4),
            visit_id,
            storage_path: Some(storage_path.clone()),
            duration_seconds: request.duration_seconds,
            file_size_bytes: Some(size_bytes),
            mime_type: AUDIO_MIME.to_string(),
            status: UploadStatus::Uploading,
            error_message: None,
            uploaded_at: None,
            transcription_started_at: None,
            transcription_completed_at: None,
            created_at: existing.as_ref().map(|u| u.created_at).unwrap_or(now),
            updated_at: now,
        };
        self.store
            .with_conn(|conn| uploads::upsert_upload(conn, &pending))?;

        if visit.status != ProcessingStatus::Uploading {
            self.advance(visit_id, ProcessingEvent::StartUpload)?;
        }

        if let Err(e) = self.transfer(&storage_path, &bytes).await {
            let message = e.to_string();
            if let Err(store_err) = self.store.with_conn(|conn| {
                uploads::mark_upload_failed(conn, visit_id, &message, Utc::now())
            }) {
                warn!(error = %store_err, "Failed to record upload failure");
            }
            warn!(error = %e, "Upload failed");
            return Err(e);
        }

        let path = storage_path.as_str();
        let duration = request.duration_seconds;
        self.retry
            .execute("confirm upload", || async move {
                self.confirm_upload(visit_id, path, duration, size_bytes)
            })
            .await?;

        remove_local(&request.local_path).await;
        info!(size_bytes, "Recording uploaded");

        Ok(UploadOutcome::Uploaded {
            storage_path,
            size_bytes,
        })
    }

    async fn transfer(&self, storage_path: &str, bytes: &[u8]) -> Result<(), EngineError> {
        let storage = &self.services.storage;
        let expiry = Duration::from_secs(self.config.signed_url_expiry_secs);

        let signed_url = self
            .retry
            .execute("sign upload url", || async move {
                storage.signed_upload_url(storage_path, expiry).await
            })
            .await?;

        let url = signed_url.as_str();
        self.retry
            .execute("upload recording", || async move {
                storage.upload(url, bytes.to_vec(), AUDIO_MIME).await
            })
            .await
    }

    /// Accept a transferred recording: upload `Uploaded`, visit `Processing`.
    ///
    /// Confirming an already accepted upload returns the stored row unchanged.
    pub fn confirm_upload(
        &self,
        visit_id: Uuid,
        storage_path: &str,
        duration_seconds: Option<f64>,
        file_size_bytes: i64,
    ) -> Result<AudioUpload, EngineError> {
        let now = Utc::now();

        self.store.with_tx(|tx| {
            let existing = uploads::get_upload_for_visit(tx, visit_id)?;
            if let Some(upload) = existing.as_ref().filter(|u| u.status.is_accepted()) {
                return Ok(upload.clone());
            }

            let confirmed = AudioUpload {
                id: existing.as_ref().map(|u| u.id).unwrap_or_else(Uuid::new_v4),
                visit_id,
                storage_path: Some(storage_path.to_string()),
                duration_seconds,
                file_size_bytes: Some(file_size_bytes),
                mime_type: AUDIO_MIME.to_string(),
                status: UploadStatus::Uploaded,
                error_message: None,
                uploaded_at: Some(now),
                transcription_started_at: None,
                transcription_completed_at: None,
                created_at: existing.as_ref().map(|u| u.created_at).unwrap_or(now),
                updated_at: now,
            };
            uploads::upsert_upload(tx, &confirmed)?;

            let to = ProcessingStatus::Uploading.transition(ProcessingEvent::ConfirmUpload)?;
            let moved = visits::transition_processing(
                tx,
                visit_id,
                &[ProcessingStatus::Uploading],
                to,
                now,
            )?;
            if !moved {
                let status = visits::get_visit(tx, visit_id)?
                    .map(|v| v.status)
                    .ok_or_else(|| EngineError::not_found("visit", visit_id))?;
                return Err(EngineError::Conflict {
                    entity: "visit",
                    id: visit_id,
                    message: format!("is {}, expected uploading", status),
                });
            }

            uploads::get_upload_for_visit(tx, visit_id)?.ok_or_else(|| {
                EngineError::Store(StoreError::Corrupt {
                    field: "audio_upload",
                    value: visit_id.to_string(),
                })
            })
        })
    }
}

async fn remove_local(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove local recording"),
    }
}
