//! Executor and pipeline file configuration

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use xpo_graph::GraphConfig;

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound for one agent call, in milliseconds
    pub agent_timeout_ms: u64,
    /// Stage steps allowed to run at once across lineages
    pub max_concurrent_lineages: usize,
    /// Phase written on new requests; the entry stage when unset. Must be a
    /// stage id, `completed` or `<stage>_failed`
    pub default_phase_on_create: Option<String>,
    /// On-demand stage run by feedback collection
    pub feedback_stage: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            agent_timeout_ms: 120_000,
            max_concurrent_lineages: 8,
            default_phase_on_create: None,
            feedback_stage: "feedback_collected".to_string(),
        }
    }
}

impl ExecutorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the agent timeout
    #[inline]
    #[must_use]
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the lineage concurrency limit (at least 1)
    #[inline]
    #[must_use]
    pub fn with_max_concurrent_lineages(mut self, limit: usize) -> Self {
        self.max_concurrent_lineages = limit.max(1);
        self
    }

    /// Set the phase written on creation
    #[inline]
    #[must_use]
    pub fn with_default_phase(mut self, phase: impl Into<String>) -> Self {
        self.default_phase_on_create = Some(phase.into());
        self
    }

    /// Set the feedback stage id
    #[inline]
    #[must_use]
    pub fn with_feedback_stage(mut self, stage: impl Into<String>) -> Self {
        self.feedback_stage = stage.into();
        self
    }

    /// Agent timeout as a [`Duration`]
    #[inline]
    #[must_use]
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }
}

/// Static agent declared in a pipeline file
///
/// Exactly one of `output`, `branches`, `soft_error` or `fatal_error` must be
/// set. Values are written into the agent's output field of the incoming
/// context, so upstream data flows through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentFixture {
    /// Agent name
    pub name: String,
    /// Field receiving the result; defaults to the name
    #[serde(default)]
    pub output_field: Option<String>,
    /// Single result
    #[serde(default)]
    pub output: Option<Value>,
    /// Fan-out results
    #[serde(default)]
    pub branches: Option<Vec<Value>>,
    /// Soft failure message
    #[serde(default)]
    pub soft_error: Option<String>,
    /// Fatal failure message
    #[serde(default)]
    pub fatal_error: Option<String>,
    /// Simulated latency
    #[serde(default)]
    pub delay_ms: u64,
}

/// Complete pipeline description: executor settings, graph and static agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFile {
    /// Executor settings
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Stage graph
    pub graph: GraphConfig,
    /// Static agents
    #[serde(default)]
    pub agents: Vec<AgentFixture>,
}

impl PipelineFile {
    /// Parse TOML text
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] on malformed input.
    pub fn from_toml_str(text: &str) -> Result<Self, PipelineError> {
        toml::from_str(text).map_err(|e| PipelineError::configuration(format!("invalid pipeline file: {e}")))
    }

    /// Read and parse a TOML file
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] when the file is unreadable or malformed.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::configuration(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }
}
