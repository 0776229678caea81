//! Domain types for the karibu engine.
//!
//! This module contains the core data structures:
//! - Visit: one clinical encounter, with its two independent status axes
//! - AudioUpload: the recording attached to a visit
//! - Notes: provider and patient notes derived from the recording
//! - MagicLink: time-boxed patient access token
//! - Staff / Clinic / Patient: the parties around a visit
//! - Events: queue change-feed records
//!
//! State machines are pure functions (`transition`) so every writer can
//! decide legality before issuing a conditional update.

use thiserror::Error;

/// Generates a `Copy` enum with `as_str`, `FromStr` and `Display` that maps
/// to the snake_case string stored in the database.
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// All variants in declaration order
            pub const ALL: &'static [$name] = &[$(Self::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::domain::ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err($crate::domain::ParseEnumError {
                        field: stringify!($name),
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub mod events;
pub mod link;
pub mod message;
pub mod note;
pub mod staff;
pub mod upload;
pub mod visit;

/// A stored string did not match any variant of a domain enum
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {field} value: {value}")]
pub struct ParseEnumError {
    pub field: &'static str,
    pub value: String,
}

/// An event was not legal in the current state of a state machine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid transition: {event} is not allowed from {from}")]
pub struct TransitionError {
    pub from: &'static str,
    pub event: String,
}

// Re-export commonly used types
pub use events::{ChangeKind, QueueChange};
pub use link::{generate_token, MagicLink};
pub use message::{MessageLog, MessageStatus, MessageVariant};
pub use note::{NoteStatus, PatientNote, ProviderNote};
pub use staff::{format_phone_number, is_valid_phone, Clinic, Patient, Role, Staff, StaffIdentity};
pub use upload::{storage_path_for, AudioUpload, UploadStatus};
pub use visit::{
    ClinicalFields, Priority, ProcessingEvent, ProcessingStatus, QueueEvent, QueueStatus, Stage,
    Visit,
};
