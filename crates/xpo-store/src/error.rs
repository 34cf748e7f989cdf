//! Storage errors

use thiserror::Error;

/// Errors raised by [`LineageStore`](crate::LineageStore),
/// [`RequestStore`](crate::RequestStore) and [`AuditSink`](crate::AuditSink)
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend could not be reached or the write did not commit
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Record does not exist
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind (`request`, `run`)
        kind: &'static str,
        /// Identifier looked up
        id: String,
    },

    /// A completed batch already occupies this step
    #[error("step {stage} under parent {parent} already has completed runs")]
    Conflict {
        /// Parent run, or `root`
        parent: String,
        /// Stage of the batch
        stage: String,
    },

    /// Guarded update rejected (superseded run, flag already set, ...)
    #[error("invalid update on run {run}: {reason}")]
    InvalidUpdate {
        /// Run targeted
        run: String,
        /// Why the guard refused
        reason: String,
    },

    /// Stored data could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Shorthand for a missing request
    #[must_use]
    pub fn request_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "request",
            id: id.to_string(),
        }
    }

    /// Shorthand for a missing run
    #[must_use]
    pub fn run_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "run",
            id: id.to_string(),
        }
    }

    /// Shorthand for a rejected flag update
    #[must_use]
    pub fn invalid_update(run: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidUpdate {
            run: run.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
