//! Broadcast fan-out of queue changes to connected boards.

use chrono::NaiveDate;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::QueueChange;

const DEFAULT_CAPACITY: usize = 256;

/// Publisher side of the queue change feed
#[derive(Debug, Clone)]
pub struct QueueFeed {
    sender: broadcast::Sender<QueueChange>,
}

impl Default for QueueFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl QueueFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a change; having no subscribers is not an error
    pub fn publish(&self, change: QueueChange) {
        if self.sender.send(change).is_err() {
            debug!("No queue subscribers connected");
        }
    }

    /// Subscribe to changes for one clinic-day
    pub fn subscribe(&self, clinic_id: Uuid, day: NaiveDate) -> QueueSubscription {
        QueueSubscription {
            rx: self.sender.subscribe(),
            clinic_id,
            day,
            missed: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A board's filtered view of the feed
#[derive(Debug)]
pub struct QueueSubscription {
    rx: broadcast::Receiver<QueueChange>,
    clinic_id: Uuid,
    day: NaiveDate,
    missed: u64,
}

impl QueueSubscription {
    /// Next change for this clinic-day, or `None` once the feed is closed.
    ///
    /// A lagging subscriber skips ahead; `missed()` tells it to re-fetch the board.
    pub async fn next(&mut self) -> Option<QueueChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.matches(self.clinic_id, self.day) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(clinic_id = %self.clinic_id, "Queue subscriber lagged, missed {} changes", n);
                    self.missed += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Changes dropped because this subscriber fell behind
    pub fn missed(&self) -> u64 {
        self.missed
    }
}
