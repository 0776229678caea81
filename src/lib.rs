//! karibu - visit lifecycle and queue coordination engine
//!
//! Coordinates a clinic visit from patient check-in to the patient
//! receiving their note.
//!
//! # Architecture
//!
//! Every visit carries two independent status axes:
//! - the queue axis (`Waiting` → `WithNurse` → `ReadyForDoctor` → `WithDoctor` → `Completed`),
//!   written only by [`QueueEngine`]
//! - the processing axis (`Recording` → `Uploading` → `Processing` → `Review` → `Sent` →
//!   `Completed`, or `Error`), written only by [`VisitPipeline`]
//!
//! All writes are compare-and-set on the current status, so concurrent
//! claims resolve to exactly one winner and duplicate deliveries are no-ops.
//! Recordings made offline are queued durably on the client and uploaded
//! by [`SyncEngine`] once the network comes back.
//!
//! # Modules
//!
//! - `adapters`: External services (object storage, OpenAI, WhatsApp)
//! - `client`: Recorder, offline pending queue and sync engine
//! - `core`: Retry primitive, cancellation, error taxonomy
//! - `domain`: Data structures and state machines
//! - `pipeline`: Upload, transcription, note generation, finalize, patient access
//! - `queue`: Clinic board and its change feed
//! - `store`: SQLite persistence
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! karibu check-in --staff <nurse-id> --patient <patient-id> -p high
//! karibu claim --staff <doctor-id> <visit-id>
//! karibu upload --staff <doctor-id> <visit-id> visit.m4a
//! karibu process <visit-id>
//! karibu finalize --staff <doctor-id> <visit-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod client;
pub mod config;
pub mod core;
pub mod domain;
pub mod pipeline;
pub mod queue;
pub mod store;

// Re-export main types at crate root for convenience
pub use client::{ClientSession, PendingQueue, SyncEngine};
pub use core::{EngineError, Retry, RetryPolicy};
pub use domain::{ProcessingStatus, QueueStatus, StaffIdentity, Visit};
pub use pipeline::VisitPipeline;
pub use queue::QueueEngine;
pub use store::Store;
