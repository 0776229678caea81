//! Background upload of pending visits.
//!
//! One flush at a time: entries go out in insertion order, reachability is
//! re-checked before each one and a dropped connection aborts the rest of the
//! batch. A failed entry records its error and stays queued for the next
//! cycle. An entry a direct submit is uploading is claimed and left alone. Flushes run at startup, after connectivity returns and settles for
//! the debounce window, and periodically while online with work pending.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::network::NetworkMonitor;
use super::pending::{PendingQueue, PendingQueueError, PendingVisit};
use crate::core::{Cancellation, EngineError, Retry};
use crate::pipeline::{UploadOutcome, VisitPipeline};

/// Sync engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Quiet period after coming back online before flushing
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Flush interval while online with entries still pending
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// Reachability probe target (no probe when unset)
    #[serde(default)]
    pub probe_url: Option<String>,

    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

fn default_debounce() -> u64 {
    2000
}
fn default_retry_interval() -> u64 {
    60
}
fn default_probe_interval() -> u64 {
    15
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
            retry_interval_secs: default_retry_interval(),
            probe_url: None,
            probe_interval_secs: default_probe_interval(),
        }
    }
}

/// Where a pending recording goes
#[async_trait]
pub trait PendingUploader: Send + Sync {
    async fn upload_pending(&self, entry: &PendingVisit) -> Result<UploadOutcome, EngineError>;
}

#[async_trait]
impl PendingUploader for VisitPipeline {
    async fn upload_pending(&self, entry: &PendingVisit) -> Result<UploadOutcome, EngineError> {
        self.upload_audio(&entry.actor, &entry.upload_request()).await
    }
}

/// Banner state for the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub pending_count: usize,
    pub is_syncing: bool,
    pub is_online: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Outcome of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub uploaded: usize,
    pub failed: usize,

    /// Entries already uploaded by an earlier cycle, now cleaned up
    pub skipped: usize,

    /// Entries left alone because a direct submit was uploading them
    pub busy: usize,

    /// Connectivity dropped before the batch finished
    pub aborted: bool,
}

/// Clears the syncing flag however the flush ends
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Exclusive hold on one pending entry while it uploads
pub struct InFlight {
    set: Arc<Mutex<HashSet<Uuid>>>,
    local_id: Uuid,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.local_id);
        }
    }
}

enum Settled {
    Online,
    Offline,
    Shutdown,
}

#[derive(Clone)]
pub struct SyncEngine {
    queue: Arc<PendingQueue>,
    uploader: Arc<dyn PendingUploader>,
    network: NetworkMonitor,
    retry: Retry,
    config: SyncConfig,
    syncing: Arc<AtomicBool>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    last_sync_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl SyncEngine {
    /// Uploads are retried on transient failures; an error that already
    /// exhausted an inner retry is not retried again.
    pub fn new(
        queue: Arc<PendingQueue>,
        uploader: Arc<dyn PendingUploader>,
        network: NetworkMonitor,
        retry: Retry,
        config: SyncConfig,
    ) -> Self {
        let retry = retry.with_predicate(|e: &EngineError, _attempt: u32| {
            e.is_retryable() && !matches!(e, EngineError::RetryExhausted { .. })
        });

        Self {
            queue,
            uploader,
            network,
            retry,
            config,
            syncing: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            last_sync_at: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Reserve an entry for upload. `None` while another path holds it.
    pub fn claim(&self, local_id: Uuid) -> Option<InFlight> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(local_id) {
            return None;
        }
        Some(InFlight {
            set: self.in_flight.clone(),
            local_id,
        })
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.last_sync_at.lock().map(|guard| *guard).unwrap_or(None)
    }

    pub async fn status(&self) -> Result<SyncStatus, EngineError> {
        Ok(SyncStatus {
            pending_count: self.queue.len().await?,
            is_syncing: self.is_syncing(),
            is_online: self.network.is_online(),
            last_sync_at: self.last_sync_at(),
        })
    }

    /// Upload every pending entry once. `None` when a flush is already running.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<Option<FlushReport>, EngineError> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        let _guard = SyncingGuard(&self.syncing);

        let entries = self.queue.list().await?;
        let mut report = FlushReport::default();

        if entries.is_empty() {
            return Ok(Some(report));
        }
        info!(pending = entries.len(), "Syncing pending visits");

        for (i, listed) in entries.iter().enumerate() {
            if !self.network.is_online() {
                warn!(remaining = entries.len() - i, "Went offline, aborting sync");
                report.aborted = true;
                break;
            }

            let Some(_claim) = self.claim(listed.local_id) else {
                debug!(local_id = %listed.local_id, "Entry is being uploaded directly, leaving it");
                report.busy += 1;
                continue;
            };

            // A direct submit may have finished this entry since the listing
            let entry = match self.queue.get(listed.local_id).await? {
                Some(entry) if !entry.uploaded => entry,
                Some(_) => {
                    self.queue.complete(listed.local_id).await?;
                    report.skipped += 1;
                    continue;
                }
                None => {
                    report.skipped += 1;
                    continue;
                }
            };

            let uploader = &self.uploader;
            let pending = &entry;
            let result = self
                .retry
                .execute("sync pending visit", || async move {
                    uploader.upload_pending(pending).await
                })
                .await;

            match result {
                Ok(_) => {
                    self.queue.complete(entry.local_id).await?;
                    report.uploaded += 1;
                    info!(local_id = %entry.local_id, visit_id = %entry.visit_id, "Pending visit synced");
                }
                Err(e) => {
                    match self.queue.record_failure(entry.local_id, &e.to_string()).await {
                        Ok(()) | Err(PendingQueueError::NotFound(_)) => {}
                        Err(other) => return Err(other.into()),
                    }
                    report.failed += 1;
                    warn!(local_id = %entry.local_id, visit_id = %entry.visit_id, error = %e, "Pending visit sync failed");
                }
            }
        }

        if !report.aborted {
            if let Ok(mut last) = self.last_sync_at.lock() {
                *last = Some(Utc::now());
            }
        }
        if report.uploaded + report.skipped > 0 {
            self.queue.compact().await?;
        }

        info!(
            uploaded = report.uploaded,
            failed = report.failed,
            skipped = report.skipped,
            busy = report.busy,
            aborted = report.aborted,
            "Sync finished"
        );
        Ok(Some(report))
    }

    async fn flush_logged(&self) {
        if let Err(e) = self.flush().await {
            error!(error = %e, "Sync flush failed");
        }
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(&self, shutdown: Cancellation) {
        let mut online_rx = self.network.subscribe();
        let mut was_online = *online_rx.borrow_and_update();

        if was_online && self.has_pending().await {
            self.flush_logged().await;
        }

        let period = Duration::from_secs(self.config.retry_interval_secs.max(1));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    if online && !was_online {
                        match self.settle(&mut online_rx, &shutdown).await {
                            Settled::Online => {
                                was_online = true;
                                self.flush_logged().await;
                            }
                            Settled::Offline => was_online = false,
                            Settled::Shutdown => break,
                        }
                    } else {
                        was_online = online;
                    }
                }
                _ = tokio::time::sleep(period) => {
                    if self.network.is_online() && self.has_pending().await {
                        self.flush_logged().await;
                    }
                }
            }
        }

        info!("Sync engine stopped");
    }

    /// Spawn [`run`](Self::run) as a background task
    pub fn spawn(&self, shutdown: Cancellation) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    }

    /// Wait out the debounce window; any flap restarts it
    async fn settle(&self, rx: &mut watch::Receiver<bool>, shutdown: &Cancellation) -> Settled {
        let window = Duration::from_millis(self.config.debounce_ms);
        let mut online = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Settled::Shutdown,
                _ = tokio::time::sleep(window) => {
                    return if online { Settled::Online } else { Settled::Offline };
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Settled::Shutdown;
                    }
                    online = *rx.borrow_and_update();
                }
            }
        }
    }

    async fn has_pending(&self) -> bool {
        match self.queue.is_empty().await {
            Ok(empty) => !empty,
            Err(e) => {
                error!(error = %e, "Failed to read pending queue");
                false
            }
        }
    }
}
