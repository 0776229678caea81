//! Canonical local paths.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! ```rust,ignore
//! use karibu::config::paths;
//!
//! let db = paths::database()?;
//! let queue = paths::pending_queue()?;
//! ```

use std::path::PathBuf;

use anyhow::Result;

/// SQLite database (~/.karibu/karibu.db)
pub fn database() -> Result<PathBuf> {
    Ok(crate::config::config()?.database.clone())
}

/// Offline upload queue (~/.karibu/pending_visits.jsonl)
pub fn pending_queue() -> Result<PathBuf> {
    Ok(crate::config::config()?.pending_queue())
}
