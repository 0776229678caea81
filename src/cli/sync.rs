//! Offline queue subcommands.
//!
//! - `status`: pending count and failed entries
//! - `list`: every queued recording
//! - `flush`: upload everything pending once
//! - `run`: keep syncing in the foreground until Ctrl-C

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Subcommand;

use super::build_pipeline;
use crate::client::{NetworkMonitor, PendingQueue, SyncEngine};
use crate::config::{self, paths};
use crate::core::{Cancellation, Retry};
use crate::store::Store;

#[derive(Subcommand, Debug)]
pub enum SyncCommands {
    /// Show the offline queue summary
    Status,

    /// List queued recordings
    List,

    /// Upload every queued recording now
    Flush,

    /// Sync in the foreground, following network changes
    Run,
}

pub async fn execute(command: SyncCommands) -> Result<()> {
    match command {
        SyncCommands::Status => status().await,
        SyncCommands::List => list().await,
        SyncCommands::Flush => flush().await,
        SyncCommands::Run => run().await,
    }
}

async fn open_queue() -> Result<Arc<PendingQueue>> {
    let path = paths::pending_queue()?;
    let queue = PendingQueue::open(path.clone())
        .await
        .with_context(|| format!("Failed to open pending queue: {}", path.display()))?;
    Ok(Arc::new(queue))
}

async fn engine(network: NetworkMonitor) -> Result<SyncEngine> {
    let cfg = config::config()?;
    let queue = open_queue().await?;
    let store = Arc::new(Store::open(&cfg.database)?);
    let uploader = Arc::new(build_pipeline(store)?);

    Ok(SyncEngine::new(
        queue,
        uploader,
        network,
        Retry::new(cfg.retry.clone()),
        cfg.sync.clone(),
    ))
}

async fn status() -> Result<()> {
    let queue = open_queue().await?;
    let pending = queue.list().await?;
    let failed = pending.iter().filter(|p| p.last_error.is_some()).count();

    println!("Pending recordings: {}", pending.len());
    println!("With failed attempts: {}", failed);
    if let Some(oldest) = pending.iter().map(|p| p.recorded_at).min() {
        println!("Oldest recorded at: {}", oldest.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
}

async fn list() -> Result<()> {
    let queue = open_queue().await?;
    let pending = queue.list().await?;
    if pending.is_empty() {
        println!("Nothing queued.");
        return Ok(());
    }

    println!(
        "{:<38} {:<38} {:>8} {:<20}",
        "LOCAL ID", "VISIT ID", "ATTEMPTS", "LAST ERROR"
    );
    println!("{}", "-".repeat(110));
    for entry in pending {
        let error: String = entry
            .last_error
            .as_deref()
            .unwrap_or("-")
            .chars()
            .take(40)
            .collect();
        println!(
            "{:<38} {:<38} {:>8} {:<20}",
            entry.local_id,
            entry.visit_id,
            entry.attempts,
            error
        );
    }
    Ok(())
}

async fn flush() -> Result<()> {
    let sync = engine(NetworkMonitor::new(true)).await?;

    match sync.flush().await? {
        Some(report) => {
            println!("Uploaded: {}", report.uploaded);
            println!("Failed:   {}", report.failed);
            println!("Skipped:  {}", report.skipped);
            println!("Busy:     {}", report.busy);
            if report.aborted {
                println!("Stopped early: network went offline");
            }
        }
        None => println!("A sync is already running."),
    }
    Ok(())
}

async fn run() -> Result<()> {
    let cfg = config::config()?;
    let network = NetworkMonitor::new(true);
    let sync = engine(network.clone()).await?;
    let shutdown = Cancellation::new();

    let probe = cfg.sync.probe_url.clone().map(|url| {
        network.spawn_probe(
            url,
            Duration::from_secs(cfg.sync.probe_interval_secs),
            shutdown.clone(),
        )
    });
    let worker = sync.spawn(shutdown.clone());

    println!("Syncing. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;
    shutdown.cancel();

    worker.await?;
    if let Some(probe) = probe {
        probe.await?;
    }

    let status = sync.status().await?;
    println!("Stopped with {} recording(s) pending.", status.pending_count);
    Ok(())
}
