//! Explicit per-user client context.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::network::NetworkMonitor;
use super::pending::{PendingQueue, PendingQueueError};
use super::recorder::{Recorder, Recording};
use super::sync::{PendingUploader, SyncEngine, SyncStatus};
use crate::core::{Cancellation, EngineError, Retry};
use crate::domain::StaffIdentity;
use crate::pipeline::UploadOutcome;

/// Everything a signed-in staff member's client holds
pub struct ClientSession {
    identity: StaffIdentity,
    queue: Arc<PendingQueue>,
    network: NetworkMonitor,
    uploader: Arc<dyn PendingUploader>,
    sync: SyncEngine,
    retry: Retry,
    recorder: Recorder,
}

impl ClientSession {
    pub fn new(
        identity: StaffIdentity,
        queue: Arc<PendingQueue>,
        network: NetworkMonitor,
        uploader: Arc<dyn PendingUploader>,
        sync: SyncEngine,
        retry: Retry,
        recorder: Recorder,
    ) -> Self {
        Self {
            identity,
            queue,
            network,
            uploader,
            sync,
            retry,
            recorder,
        }
    }

    pub fn identity(&self) -> &StaffIdentity {
        &self.identity
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    pub async fn sync_status(&self) -> Result<SyncStatus, EngineError> {
        self.sync.status().await
    }

    /// Start background sync; stops when `shutdown` is cancelled
    pub fn start_sync(&self, shutdown: Cancellation) -> JoinHandle<()> {
        self.sync.spawn(shutdown)
    }

    pub async fn record(
        &self,
        visit_id: Uuid,
        chunks: mpsc::Receiver<Vec<u8>>,
        cancel: &Cancellation,
    ) -> Result<Recording, EngineError> {
        self.recorder.record(visit_id, chunks, cancel).await
    }

    /// Hand a finished recording to the backend.
    ///
    /// The recording is queued locally first. When online it is uploaded
    /// right away; when offline, or when the upload fails transiently, it
    /// stays queued and [`EngineError::OfflineDeferral`] is returned. A
    /// permanent rejection drops the entry and deletes the local file.
    pub async fn submit_recording(
        &self,
        recording: &Recording,
    ) -> Result<UploadOutcome, EngineError> {
        let queued = self
            .queue
            .enqueue(
                recording.visit_id,
                self.identity,
                &recording.path,
                Some(recording.duration_seconds),
            )
            .await?;
        let entry = queued.entry().clone();

        if !self.network.is_online() {
            info!(local_id = %entry.local_id, "Offline, recording will sync later");
            return Err(EngineError::OfflineDeferral {
                local_id: entry.local_id,
            });
        }

        let Some(_claim) = self.sync.claim(entry.local_id) else {
            info!(local_id = %entry.local_id, "Background sync is already uploading this recording");
            return Err(EngineError::OfflineDeferral {
                local_id: entry.local_id,
            });
        };

        let uploader = &self.uploader;
        let pending = &entry;
        let result = self
            .retry
            .execute("upload recording", || async move {
                uploader.upload_pending(pending).await
            })
            .await;

        match result {
            Ok(outcome) => {
                self.queue.complete(entry.local_id).await?;
                Ok(outcome)
            }
            Err(e) if e.is_retryable() => {
                self.queue
                    .record_failure(entry.local_id, &e.to_string())
                    .await?;
                warn!(local_id = %entry.local_id, error = %e, "Upload failed, recording will sync later");
                Err(EngineError::OfflineDeferral {
                    local_id: entry.local_id,
                })
            }
            Err(e) => {
                // Retrying cannot fix this one; the caller sees the error instead
                match self.queue.remove(entry.local_id).await {
                    Ok(()) | Err(PendingQueueError::NotFound(_)) => {}
                    Err(other) => return Err(other.into()),
                }
                if let Err(io) = tokio::fs::remove_file(&recording.path).await {
                    if io.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %recording.path.display(), error = %io, "Failed to delete rejected recording");
                    }
                }
                warn!(local_id = %entry.local_id, error = %e, "Upload rejected, recording discarded");
                Err(e)
            }
        }
    }
}
