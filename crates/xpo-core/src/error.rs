//! Error types for the pipeline core
//!
//! Agent failures are data, not control flow: [`AgentError`] values are
//! turned into run records by the executor and never surface as
//! [`PipelineError`].

use xpo_graph::GraphError;
use xpo_store::StoreError;

/// Failure reported by an agent
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    /// Agent ran but produced degraded output; the lineage continues
    #[error("soft agent error: {0}")]
    Soft(String),

    /// Agent could not run; the lineage halts
    #[error("fatal agent error: {0}")]
    Fatal(String),
}

impl AgentError {
    /// Create a soft error
    #[inline]
    pub fn soft(message: impl Into<String>) -> Self {
        Self::Soft(message.into())
    }

    /// Create a fatal error
    #[inline]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// `soft` or `fatal`
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Soft(_) => "soft",
            Self::Fatal(_) => "fatal",
        }
    }

    /// Message without the kind prefix
    #[inline]
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Soft(m) | Self::Fatal(m) => m,
        }
    }

    /// Check if the lineage may continue
    #[inline]
    #[must_use]
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::Soft(_))
    }
}

/// Main pipeline error type
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Store unavailable or write rejected; the whole call was aborted
    #[error("persistence failure: {0}")]
    Persistence(StoreError),

    /// Invalid graph, agent binding or pipeline file (startup only)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unknown request
    #[error("request not found: {0}")]
    RequestNotFound(String),

    /// Unknown run
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// Deployment bookkeeping refused
    #[error("deployment rejected: {0}")]
    Deployment(String),

    /// A lineage task panicked or was cancelled
    #[error("lineage task failed: {0}")]
    Join(String),
}

impl PipelineError {
    /// Check if calling again (usually `resume`) may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Join(_))
    }

    /// Create a configuration error
    #[inline]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind: "request", id } => Self::RequestNotFound(id),
            StoreError::NotFound { kind: "run", id } => Self::RunNotFound(id),
            other => Self::Persistence(other),
        }
    }
}

impl From<GraphError> for PipelineError {
    fn from(err: GraphError) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_classified() {
        let missing: PipelineError = StoreError::request_not_found("r1").into();
        assert!(matches!(missing, PipelineError::RequestNotFound(ref id) if id == "r1"));
        assert!(!missing.is_retryable());

        let down: PipelineError = StoreError::Unavailable("disk".into()).into();
        assert!(down.is_retryable());

        let config: PipelineError = GraphError::Cycle.into();
        assert!(!config.is_retryable());
    }

    #[test]
    fn agent_error_accessors() {
        let soft = AgentError::soft("could not parse model output");
        assert!(soft.is_soft());
        assert_eq!(soft.kind(), "soft");
        assert_eq!(AgentError::fatal("auth").message(), "auth");
    }
}
