//! Magic links: time-boxed patient access to a finalized note.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token entropy in bytes (hex-encoded to twice the length)
pub const TOKEN_BYTES: usize = 32;

/// A patient access token for one visit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagicLink {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub visit_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,

    /// First time the patient opened the link
    pub first_accessed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl MagicLink {
    /// Mint a fresh link with a random token
    pub fn issue(patient_id: Uuid, visit_id: Uuid, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id,
            visit_id,
            token: generate_token(),
            expires_at: now + ttl,
            first_accessed_at: None,
            created_at: now,
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// High-entropy opaque token (never a sequence number)
pub fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    hex::encode(bytes)
}
