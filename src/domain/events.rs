//! Change-feed records published by the queue engine.
//!
//! Queue boards subscribe per clinic and calendar day; every accepted queue
//! mutation produces exactly one `QueueChange`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::visit::{Priority, QueueStatus};

/// A single accepted queue mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueChange {
    /// Clinic the visit belongs to (feed key)
    pub clinic_id: Uuid,

    /// The visit that changed
    pub visit_id: Uuid,

    /// Clinic-local day of the visit (feed filter)
    pub visit_date: NaiveDate,

    /// What happened
    pub kind: ChangeKind,

    /// Queue status after the change
    pub queue_status: QueueStatus,

    /// Staff member who caused the change
    pub actor_id: Uuid,

    /// When the change was committed
    pub at: DateTime<Utc>,
}

/// Kinds of queue changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeKind {
    /// A new visit joined the queue
    CheckedIn { queue_position: i64 },

    /// Queue status moved
    Transitioned { from: QueueStatus, to: QueueStatus },

    /// Priority was changed
    PriorityChanged { priority: Priority },

    /// Chief complaint was edited
    DetailsUpdated,
}

impl QueueChange {
    /// Whether this change belongs to a board for `clinic_id` on `day`
    pub fn matches(&self, clinic_id: Uuid, day: NaiveDate) -> bool {
        self.clinic_id == clinic_id && self.visit_date == day
    }
}
