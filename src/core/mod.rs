//! Core engine primitives.
//!
//! This module contains:
//! - Error: the engine's error taxonomy and user-facing classification
//! - Retry: the single retry/backoff executor every remote call goes through
//! - Cancel: cooperative cancellation for waits and recordings

pub mod cancel;
pub mod error;
pub mod retry;

// Re-export commonly used types
pub use cancel::Cancellation;
pub use error::{EngineError, ErrorClass, UserAction};
pub use retry::{Retry, RetryPolicy, RetryPredicate};
