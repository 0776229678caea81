//! JSONL-backed queue of recordings not yet accepted by the backend.
//!
//! Append-only like the rest of the local state: every change is a new line,
//! current entries come from replaying the log in order. Appends hold an
//! exclusive file lock so a second client process cannot interleave lines.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::StaffIdentity;
use crate::pipeline::UploadRequest;

/// Errors that can occur with the pending queue
#[derive(Debug, Error)]
pub enum PendingQueueError {
    #[error("Pending visit not found: {0}")]
    NotFound(Uuid),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to replace queue log: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// A line in the queue log
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingEvent {
    timestamp: DateTime<Utc>,

    local_id: Uuid,

    #[serde(flatten)]
    kind: PendingEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum PendingEventKind {
    Enqueued { entry: Box<PendingVisit> },
    AttemptFailed { error: String },
    MarkedUploaded,
    Removed,
}

/// A recording waiting to be uploaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingVisit {
    pub local_id: Uuid,
    pub visit_id: Uuid,

    /// Who recorded it; uploads run under this identity
    pub actor: StaffIdentity,

    pub local_path: PathBuf,
    pub duration_seconds: Option<f64>,
    pub size_bytes: u64,

    /// SHA256 of the recording (first 16 hex chars)
    pub content_hash: String,

    pub recorded_at: DateTime<Utc>,

    #[serde(default)]
    pub uploaded: bool,

    #[serde(default)]
    pub attempts: u32,

    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl PendingVisit {
    pub fn upload_request(&self) -> UploadRequest {
        UploadRequest {
            visit_id: self.visit_id,
            local_path: self.local_path.clone(),
            duration_seconds: self.duration_seconds,
        }
    }
}

/// Result of enqueueing a recording
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// New entry
    Queued(PendingVisit),

    /// The same recording was already waiting
    AlreadyQueued(PendingVisit),

    /// A different recording for the visit replaced the waiting one
    Replaced(PendingVisit),
}

impl EnqueueResult {
    pub fn entry(&self) -> &PendingVisit {
        match self {
            Self::Queued(entry) | Self::AlreadyQueued(entry) | Self::Replaced(entry) => entry,
        }
    }

    pub fn is_new(&self) -> bool {
        !matches!(self, Self::AlreadyQueued(_))
    }
}

/// Local queue of pending visits
pub struct PendingQueue {
    path: PathBuf,

    /// Serialises read-then-append sequences within this process
    guard: Mutex<()>,
}

impl PendingQueue {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            guard: Mutex::new(()),
        }
    }

    /// Open a queue, creating its directory
    pub async fn open(path: PathBuf) -> Result<Self, PendingQueueError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, local_id: Uuid, kind: PendingEventKind) -> Result<(), PendingQueueError> {
        let event = PendingEvent {
            timestamp: Utc::now(),
            local_id,
            kind,
        };
        let json = serde_json::to_string(&event)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        writeln!(file, "{}", json)?;
        file.flush()?;
        file.sync_data()?;

        // Lock is released when file is dropped
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<PendingVisit>, PendingQueueError> {
        let mut entries: Vec<PendingVisit> = Vec::new();

        if !fs::try_exists(&self.path).await? {
            return Ok(entries);
        }

        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            // A crash mid-append leaves at most one torn line
            let event: PendingEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    warn!(line = line_no, error = %e, "Skipping unreadable pending queue line");
                    continue;
                }
            };
            apply_event(&mut entries, event);
        }

        Ok(entries)
    }

    /// Add a finished recording; re-adding the same recording is a no-op
    pub async fn enqueue(
        &self,
        visit_id: Uuid,
        actor: StaffIdentity,
        local_path: &Path,
        duration_seconds: Option<f64>,
    ) -> Result<EnqueueResult, PendingQueueError> {
        let _guard = self.guard.lock().await;

        let content = fs::read(local_path).await?;
        let content_hash = hash_content(&content);

        let entries = self.replay().await?;
        let existing = entries.into_iter().find(|e| e.visit_id == visit_id);

        if let Some(existing) = &existing {
            if existing.content_hash == content_hash {
                return Ok(EnqueueResult::AlreadyQueued(existing.clone()));
            }
            self.append(existing.local_id, PendingEventKind::Removed)?;
        }

        let entry = PendingVisit {
            local_id: Uuid::new_v4(),
            visit_id,
            actor,
            local_path: local_path.to_path_buf(),
            duration_seconds,
            size_bytes: content.len() as u64,
            content_hash,
            recorded_at: Utc::now(),
            uploaded: false,
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
        };
        self.append(
            entry.local_id,
            PendingEventKind::Enqueued {
                entry: Box::new(entry.clone()),
            },
        )?;

        info!(local_id = %entry.local_id, visit_id = %visit_id, "Recording queued for upload");

        Ok(match existing {
            Some(_) => EnqueueResult::Replaced(entry),
            None => EnqueueResult::Queued(entry),
        })
    }

    /// All entries in insertion order
    pub async fn list(&self) -> Result<Vec<PendingVisit>, PendingQueueError> {
        self.replay().await
    }

    pub async fn get(&self, local_id: Uuid) -> Result<Option<PendingVisit>, PendingQueueError> {
        Ok(self
            .replay()
            .await?
            .into_iter()
            .find(|e| e.local_id == local_id))
    }

    pub async fn len(&self) -> Result<usize, PendingQueueError> {
        Ok(self.replay().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, PendingQueueError> {
        Ok(self.len().await? == 0)
    }

    /// Record a failed attempt; the entry stays queued
    pub async fn record_failure(
        &self,
        local_id: Uuid,
        error: &str,
    ) -> Result<(), PendingQueueError> {
        self.append_for_existing(local_id, PendingEventKind::AttemptFailed {
            error: error.to_string(),
        })
        .await
    }

    pub async fn mark_uploaded(&self, local_id: Uuid) -> Result<(), PendingQueueError> {
        self.append_for_existing(local_id, PendingEventKind::MarkedUploaded)
            .await
    }

    pub async fn remove(&self, local_id: Uuid) -> Result<(), PendingQueueError> {
        self.append_for_existing(local_id, PendingEventKind::Removed)
            .await
    }

    /// Mark an entry uploaded and drop it in one step. `false` when it was
    /// already gone, i.e. another upload path finished it first.
    pub async fn complete(&self, local_id: Uuid) -> Result<bool, PendingQueueError> {
        let _guard = self.guard.lock().await;
        if !self.replay().await?.iter().any(|e| e.local_id == local_id) {
            return Ok(false);
        }
        self.append(local_id, PendingEventKind::MarkedUploaded)?;
        self.append(local_id, PendingEventKind::Removed)?;
        Ok(true)
    }

    async fn append_for_existing(
        &self,
        local_id: Uuid,
        kind: PendingEventKind,
    ) -> Result<(), PendingQueueError> {
        let _guard = self.guard.lock().await;
        if !self.replay().await?.iter().any(|e| e.local_id == local_id) {
            return Err(PendingQueueError::NotFound(local_id));
        }
        self.append(local_id, kind)
    }

    /// Rewrite the log with one `enqueued` line per live entry
    pub async fn compact(&self) -> Result<usize, PendingQueueError> {
        let _guard = self.guard.lock().await;
        let entries = self.replay().await?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let lock = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        lock.lock_exclusive()?;

        let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
        for entry in &entries {
            let event = PendingEvent {
                timestamp: entry.recorded_at,
                local_id: entry.local_id,
                kind: PendingEventKind::Enqueued {
                    entry: Box::new(entry.clone()),
                },
            };
            writeln!(temp, "{}", serde_json::to_string(&event)?)?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path)?;

        debug!(entries = entries.len(), "Compacted pending queue");
        Ok(entries.len())
    }
}

fn apply_event(entries: &mut Vec<PendingVisit>, event: PendingEvent) {
    let position = entries.iter().position(|e| e.local_id == event.local_id);

    match (event.kind, position) {
        (PendingEventKind::Enqueued { entry }, None) => entries.push(*entry),
        (PendingEventKind::Enqueued { .. }, Some(_)) => {}
        (PendingEventKind::AttemptFailed { error }, Some(i)) => {
            let entry = &mut entries[i];
            entry.attempts += 1;
            entry.last_error = Some(error);
            entry.last_attempt_at = Some(event.timestamp);
        }
        (PendingEventKind::MarkedUploaded, Some(i)) => entries[i].uploaded = true,
        (PendingEventKind::Removed, Some(i)) => {
            entries.remove(i);
        }
        (_, None) => {}
    }
}

/// SHA256 of a recording (first 16 hex chars)
pub fn hash_content(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())[..16].to_string()
}
