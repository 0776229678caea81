//! Offline-capable client side.
//!
//! Recordings are written locally, queued durably and uploaded when the
//! network allows. Nothing in the queue is dropped without the user seeing
//! an error for it.

pub mod network;
pub mod pending;
pub mod recorder;
pub mod session;
pub mod sync;

pub use network::NetworkMonitor;
pub use pending::{EnqueueResult, PendingQueue, PendingQueueError, PendingVisit};
pub use recorder::{Recorder, Recording};
pub use session::ClientSession;
pub use sync::{FlushReport, PendingUploader, SyncConfig, SyncEngine, SyncStatus};
