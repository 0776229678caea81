//! Network reachability flag with change notification.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::core::Cancellation;

/// Shared reachability state; clones observe the same flag
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the flag; subscribers only wake on an actual change
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Network reachability changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Probe `url` every `interval` and feed the result into the flag
    pub fn spawn_probe(
        &self,
        url: String,
        interval: Duration,
        shutdown: Cancellation,
    ) -> JoinHandle<()> {
        let monitor = self.clone();

        tokio::spawn(async move {
            let client = match reqwest::Client::builder().timeout(interval).build() {
                Ok(client) => client,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to build probe client");
                    return;
                }
            };

            loop {
                let reachable = match client.head(&url).send().await {
                    Ok(response) => !response.status().is_server_error(),
                    Err(e) => {
                        debug!(error = %e, "Reachability probe failed");
                        false
                    }
                };
                monitor.set_online(reachable);

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }
}
