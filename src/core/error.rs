//! Error taxonomy shared by the queue engine, the pipeline and the client.
//!
//! Every failure maps to an [`ErrorClass`] so callers can choose between
//! retrying automatically, prompting the user, or doing nothing.

use thiserror::Error;
use uuid::Uuid;

use crate::client::pending::PendingQueueError;
use crate::domain::{Role, Stage, TransitionError};
use crate::store::StoreError;

/// Coarse classification of an [`EngineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input or unmet precondition; never retried
    Validation,
    /// Network / timeout / 5xx; retried per policy
    Transient,
    /// Another actor won a race; re-fetch state, never retry the same claim
    Conflict,
    /// A pipeline stage exhausted its retries; needs a human retry
    PipelineStage,
    /// Work was queued locally instead of failing
    OfflineDeferral,
    /// Local fault (corrupt data, I/O, cancellation)
    Internal,
}

/// What the UI layer should do with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    RetryAutomatically,
    PromptUser,
    NoActionNeeded,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Role {role} may not {operation}")]
    Forbidden { role: Role, operation: &'static str },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{service} rejected the request (HTTP {status}): {message}")]
    Rejected {
        service: &'static str,
        status: u16,
        message: String,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("{entity} {id} {message}")]
    Conflict {
        entity: &'static str,
        id: Uuid,
        message: String,
    },

    #[error("{stage} stage failed for visit {visit_id}: {message}")]
    PipelineStage {
        stage: Stage,
        visit_id: Uuid,
        message: String,
    },

    #[error("Offline: recording saved locally as {local_id} and will sync when online")]
    OfflineDeferral { local_id: Uuid },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Timed out waiting for {what} after {attempts} checks")]
    PollTimeout { what: &'static str, attempts: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Local queue error: {0}")]
    LocalQueue(#[from] PendingQueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_)
            | Self::Forbidden { .. }
            | Self::NotFound { .. }
            | Self::Rejected { .. }
            | Self::Transition(_) => ErrorClass::Validation,
            Self::Transient(_) | Self::PollTimeout { .. } => ErrorClass::Transient,
            Self::Conflict { .. } => ErrorClass::Conflict,
            Self::PipelineStage { .. } => ErrorClass::PipelineStage,
            Self::OfflineDeferral { .. } => ErrorClass::OfflineDeferral,
            Self::RetryExhausted { source, .. } => source.class(),
            Self::Store(e) if e.is_busy() => ErrorClass::Transient,
            Self::Store(_) | Self::LocalQueue(_) | Self::Io(_) | Self::Cancelled => {
                ErrorClass::Internal
            }
        }
    }

    /// Default retry predicate: only transient failures are worth repeating
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }

    /// The innermost error, unwrapping retry exhaustion
    pub fn root(&self) -> &EngineError {
        match self {
            Self::RetryExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn suggested_action(&self) -> UserAction {
        match self.class() {
            ErrorClass::Transient => UserAction::RetryAutomatically,
            ErrorClass::OfflineDeferral => UserAction::NoActionNeeded,
            _ => UserAction::PromptUser,
        }
    }

    /// Text shown to staff
    pub fn user_message(&self) -> String {
        match self.root() {
            Self::Conflict { .. } => "Already claimed by someone else".to_string(),
            Self::PipelineStage { stage, message, .. } => {
                format!("{} failed: {}. Retry this step to continue.", stage, message)
            }
            Self::OfflineDeferral { .. } => {
                "Unable to connect. Your data is saved and will sync when online.".to_string()
            }
            Self::PollTimeout { .. } => "Processing timed out. Please try again.".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        assert_eq!(
            EngineError::validation("bad").class(),
            ErrorClass::Validation
        );
        assert_eq!(EngineError::transient("503").class(), ErrorClass::Transient);
        assert_eq!(
            EngineError::OfflineDeferral {
                local_id: Uuid::new_v4()
            }
            .suggested_action(),
            UserAction::NoActionNeeded
        );
    }

    #[test]
    fn test_exhausted_keeps_source_class() {
        let err = EngineError::RetryExhausted {
            operation: "upload".to_string(),
            attempts: 3,
            source: Box::new(EngineError::transient("HTTP 503")),
        };

        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.to_string().contains("after 3 attempts"));
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[test]
    fn test_conflict_user_message() {
        let err = EngineError::Conflict {
            entity: "visit",
            id: Uuid::new_v4(),
            message: "is no longer in waiting state".to_string(),
        };

        assert!(err.is_conflict());
        assert!(!err.is_retryable());
        assert_eq!(err.user_message(), "Already claimed by someone else");
    }
}
