//! Local recording sink.
//!
//! Audio capture itself belongs to the platform; it hands encoded chunks
//! over a channel and the recorder persists them under the recordings
//! directory.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::{Cancellation, EngineError};

/// A finished recording on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub visit_id: Uuid,
    pub path: PathBuf,
    pub duration_seconds: f64,
    pub size_bytes: u64,
}

pub struct Recorder {
    dir: PathBuf,
}

impl Recorder {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write chunks until the sender side closes (stop) or `cancel` fires.
    ///
    /// Cancelling discards the partial file.
    pub async fn record(
        &self,
        visit_id: Uuid,
        mut chunks: mpsc::Receiver<Vec<u8>>,
        cancel: &Cancellation,
    ) -> Result<Recording, EngineError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self
            .dir
            .join(format!("{}-{}.m4a", visit_id, Utc::now().timestamp_millis()));

        let mut file = File::create(&path).await?;
        let started = Instant::now();
        let mut size_bytes = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    drop(file);
                    discard(&path).await;
                    info!(visit_id = %visit_id, "Recording cancelled");
                    return Err(EngineError::Cancelled);
                }
                chunk = chunks.recv() => match chunk {
                    Some(bytes) => {
                        if let Err(e) = file.write_all(&bytes).await {
                            drop(file);
                            discard(&path).await;
                            return Err(e.into());
                        }
                        size_bytes += bytes.len() as u64;
                    }
                    None => break,
                },
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        let duration_seconds = started.elapsed().as_secs_f64();
        info!(visit_id = %visit_id, size_bytes, duration_seconds, "Recording stopped");

        Ok(Recording {
            visit_id,
            path,
            duration_seconds,
            size_bytes,
        })
    }
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to discard partial recording");
    }
}
