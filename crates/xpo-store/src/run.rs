//! Run records: immutable lineage nodes
//!
//! Provides:
//! - [`Run`]: one lineage's state after one stage attempt
//! - [`RunDraft`]: what the executor hands the store; ids, attempts and
//!   timestamps are assigned on append
//! - [`StepKey`]: the idempotency slot `(request, parent, stage)`
//! - [`TerminalFlags`]: the only fields written after creation

use crate::ids::{RequestId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use xpo_graph::StageId;

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Readable for compatibility; never persisted by the executor
    InProgress,
    /// Stage settled (possibly with soft errors in the output)
    Completed,
    /// Fatal failure or timeout; the lineage halted here
    Failed,
}

impl RunStatus {
    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Why a lineage stopped before the terminal stage without failing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageEnd {
    /// A fan-out agent returned zero outcomes
    NoBranches,
}

impl LineageEnd {
    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoBranches => "no_branches",
        }
    }
}

impl FromStr for LineageEnd {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_branches" => Ok(Self::NoBranches),
            other => Err(format!("unknown lineage end: {other}")),
        }
    }
}

/// Write-once fields on a terminal leaf
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalFlags {
    /// Deployment approval granted by the terminal stage
    pub approved: bool,
    /// Set once an external workflow deployed the experiment
    pub deployed_at: Option<DateTime<Utc>>,
}

/// Guarded flag update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagUpdate {
    /// Grant approval
    Approve,
    /// Record deployment
    Deploy(DateTime<Utc>),
}

/// Idempotency slot of one stage step
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepKey {
    /// Owning request
    pub request_id: RequestId,
    /// Parent run, `None` for the first run of the forest
    pub parent: Option<RunId>,
    /// Stage being executed
    pub stage: StageId,
}

impl StepKey {
    /// Create a step key
    #[must_use]
    pub fn new(request_id: RequestId, parent: Option<RunId>, stage: StageId) -> Self {
        Self {
            request_id,
            parent,
            stage,
        }
    }

    /// Parent as text, `root` when absent
    #[must_use]
    pub fn parent_key(&self) -> String {
        self.parent.map_or_else(|| "root".to_string(), |p| p.to_string())
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.request_id, self.parent_key(), self.stage)
    }
}

/// Run contents prepared by the executor
#[derive(Debug, Clone, PartialEq)]
pub struct RunDraft {
    /// Status to persist
    pub status: RunStatus,
    /// Context handed to the agents
    pub input: Value,
    /// Merged outcome
    pub output: Value,
    /// Position among fan-out siblings
    pub branch_index: u32,
    /// Early end marker
    pub lineage_end: Option<LineageEnd>,
}

impl RunDraft {
    /// Completed run
    #[must_use]
    pub fn completed(input: Value, output: Value) -> Self {
        Self {
            status: RunStatus::Completed,
            input,
            output,
            branch_index: 0,
            lineage_end: None,
        }
    }

    /// Failed run
    #[must_use]
    pub fn failed(input: Value, output: Value) -> Self {
        Self {
            status: RunStatus::Failed,
            ..Self::completed(input, output)
        }
    }

    /// Set the sibling position
    #[inline]
    #[must_use]
    pub fn with_branch_index(mut self, index: u32) -> Self {
        self.branch_index = index;
        self
    }

    /// Mark the lineage as ended
    #[inline]
    #[must_use]
    pub fn with_lineage_end(mut self, end: LineageEnd) -> Self {
        self.lineage_end = Some(end);
        self
    }
}

/// Immutable lineage node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Identifier
    pub id: RunId,
    /// Owning request
    pub request_id: RequestId,
    /// Parent run
    pub parent: Option<RunId>,
    /// Stage whose agents produced `output`
    pub stage: StageId,
    /// Status
    pub status: RunStatus,
    /// Context handed to the agents
    pub input: Value,
    /// Merged outcome
    pub output: Value,
    /// SHA-256 of the canonical input text
    pub input_digest: String,
    /// Position among fan-out siblings
    pub branch_index: u32,
    /// 1-based attempt for this step slot
    pub attempt: u32,
    /// Early end marker
    pub lineage_end: Option<LineageEnd>,
    /// Write-once terminal fields
    #[serde(default)]
    pub flags: TerminalFlags,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Run {
    /// Materialize a draft for `key`
    #[must_use]
    pub fn from_draft(key: &StepKey, draft: RunDraft, attempt: u32) -> Self {
        Self {
            id: RunId::new(),
            request_id: key.request_id,
            parent: key.parent,
            stage: key.stage.clone(),
            status: draft.status,
            input_digest: input_digest(&draft.input),
            input: draft.input,
            output: draft.output,
            branch_index: draft.branch_index,
            attempt,
            lineage_end: draft.lineage_end,
            flags: TerminalFlags::default(),
            created_at: Utc::now(),
        }
    }

    /// Idempotency slot this run occupies
    #[must_use]
    pub fn step_key(&self) -> StepKey {
        StepKey::new(self.request_id, self.parent, self.stage.clone())
    }

    /// Whether the run completed
    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Whether the run failed
    #[inline]
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

/// Hex SHA-256 digest of a context snapshot
///
/// `serde_json` writes object keys in sorted order, so equal values give
/// equal digests.
#[must_use]
pub fn input_digest(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digest_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":[1,2]}"#).unwrap();
        let b = json!({"a": [1, 2], "b": 1});
        assert_eq!(input_digest(&a), input_digest(&b));
        assert_ne!(input_digest(&a), input_digest(&json!({"a": [2, 1], "b": 1})));
    }

    #[test]
    fn draft_becomes_run() {
        let key = StepKey::new(RequestId::new(), None, StageId::from("segments_loaded"));
        let run = Run::from_draft(
            &key,
            RunDraft::completed(json!({"seed": true}), json!({"segments": []})).with_branch_index(2),
            1,
        );

        assert_eq!(run.parent, None);
        assert_eq!(run.branch_index, 2);
        assert_eq!(run.input_digest, input_digest(&json!({"seed": true})));
        assert_eq!(run.step_key(), key);
        assert!(!run.flags.approved);
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [RunStatus::InProgress, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("done".parse::<RunStatus>().is_err());
    }
}
