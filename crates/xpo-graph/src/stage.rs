//! Stage identifiers, merge policies and stage definitions

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Stage identifier (e.g. `roi_gap_analyzer_run`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    /// Create a stage identifier
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as `&str`
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Phase string recorded when a lineage halts at this stage
    #[inline]
    #[must_use]
    pub fn failed_phase(&self) -> String {
        format!("{}_failed", self.0)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for StageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// How the outcomes of a stage's agents become Runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// Exactly one agent; its outcome is the next context verbatim
    #[default]
    Single,
    /// Several agents run concurrently on the same input; one merged Run
    ParallelMerge,
    /// One agent returns K outcomes; K sibling Runs
    FanOut,
}

impl MergePolicy {
    /// Policy name as written in configuration
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::ParallelMerge => "parallel-merge",
            Self::FanOut => "fan-out",
        }
    }

    /// Check whether `count` agents are acceptable for this policy
    #[inline]
    #[must_use]
    pub fn accepts_agent_count(&self, count: usize) -> bool {
        match self {
            Self::Single | Self::FanOut => count == 1,
            Self::ParallelMerge => count >= 1,
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Static configuration of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Stage identifier
    pub id: StageId,
    /// Agent names, in merge order
    pub agents: Vec<String>,
    /// Merge policy
    #[serde(default)]
    pub merge: MergePolicy,
    /// Next stage, `None` for the terminal stage
    #[serde(default)]
    pub next: Option<StageId>,
    /// Output field whose presence grants deployment approval (terminal stage only)
    #[serde(default)]
    pub approval_field: Option<String>,
}

impl StageDefinition {
    /// Create a stage with an explicit policy
    #[must_use]
    pub fn new(id: impl Into<StageId>, agents: Vec<String>, merge: MergePolicy) -> Self {
        Self {
            id: id.into(),
            agents,
            merge,
            next: None,
            approval_field: None,
        }
    }

    /// Single-agent stage
    #[must_use]
    pub fn single(id: impl Into<StageId>, agent: impl Into<String>) -> Self {
        Self::new(id, vec![agent.into()], MergePolicy::Single)
    }

    /// Concurrent stage whose outcomes merge into one Run
    #[must_use]
    pub fn parallel<I, S>(id: impl Into<StageId>, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            id,
            agents.into_iter().map(Into::into).collect(),
            MergePolicy::ParallelMerge,
        )
    }

    /// Stage that splits one lineage into several
    #[must_use]
    pub fn fan_out(id: impl Into<StageId>, agent: impl Into<String>) -> Self {
        Self::new(id, vec![agent.into()], MergePolicy::FanOut)
    }

    /// Set the next stage
    #[inline]
    #[must_use]
    pub fn then(mut self, next: impl Into<StageId>) -> Self {
        self.next = Some(next.into());
        self
    }

    /// Set the approval field
    #[inline]
    #[must_use]
    pub fn with_approval_field(mut self, field: impl Into<String>) -> Self {
        self.approval_field = Some(field.into());
        self
    }

    /// Whether this stage ends the pipeline
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.next.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_policy_arity() {
        assert!(MergePolicy::Single.accepts_agent_count(1));
        assert!(!MergePolicy::Single.accepts_agent_count(2));
        assert!(!MergePolicy::FanOut.accepts_agent_count(0));
        assert!(MergePolicy::ParallelMerge.accepts_agent_count(3));
        assert!(!MergePolicy::ParallelMerge.accepts_agent_count(0));
    }

    #[test]
    fn stage_builders() {
        let stage = StageDefinition::parallel("scenario_builder_completed", ["scenario", "marketing"])
            .then("cashflow_feasibility_runs_completed");

        assert_eq!(stage.merge, MergePolicy::ParallelMerge);
        assert_eq!(stage.agents, vec!["scenario", "marketing"]);
        assert!(!stage.is_terminal());
        assert_eq!(stage.id.failed_phase(), "scenario_builder_completed_failed");
    }

    #[test]
    fn merge_policy_names_match_serde() {
        for policy in [MergePolicy::Single, MergePolicy::ParallelMerge, MergePolicy::FanOut] {
            let text = toml::Value::try_from(policy).unwrap();
            assert_eq!(text.as_str(), Some(policy.name()));
        }
    }
}
