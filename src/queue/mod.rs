//! Clinic queue coordination and its change feed.

pub mod engine;
pub mod feed;

pub use engine::{CheckIn, QueueEngine, QueueEntry, QueueStats};
pub use feed::{QueueFeed, QueueSubscription};
