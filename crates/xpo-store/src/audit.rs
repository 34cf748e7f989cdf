//! Flat step audit log
//!
//! Observability only. The executor writes these entries and never reads
//! them back.

use crate::ids::InvocationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One audited stage step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAudit {
    /// Invocation (`start`, `resume`, `retry`) that ran the step
    pub invocation_id: InvocationId,
    /// Stage id
    pub step_name: String,
    /// Position of the stage in the main chain, 1-based
    pub step_order: u32,
    /// Subject of the owning request
    pub subject_id: String,
    /// Context handed to the agents
    pub step_input: Value,
    /// Outcome written to the run(s)
    pub step_output: Value,
    /// Fields written by more than one parallel agent
    #[serde(default)]
    pub merge_conflicts: Vec<String>,
    /// Record time
    pub created_at: DateTime<Utc>,
}

impl StepAudit {
    /// Create an entry stamped now
    #[must_use]
    pub fn new(
        invocation_id: InvocationId,
        step_name: impl Into<String>,
        step_order: u32,
        subject_id: impl Into<String>,
        step_input: Value,
        step_output: Value,
    ) -> Self {
        Self {
            invocation_id,
            step_name: step_name.into(),
            step_order,
            subject_id: subject_id.into(),
            step_input,
            step_output,
            merge_conflicts: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Attach merge conflicts
    #[inline]
    #[must_use]
    pub fn with_conflicts(mut self, conflicts: Vec<String>) -> Self {
        self.merge_conflicts = conflicts;
        self
    }
}
