//! Experiment requests

use crate::ids::RequestId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Phase written once every open lineage reached the terminal stage
pub const PHASE_COMPLETED: &str = "completed";

/// Caller-supplied fields of a new request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRequest {
    /// Subject entity (a product, for instance)
    pub subject_id: String,
    /// Free-text objective
    pub objective: String,
    /// Free-text use case
    pub usecase: String,
    /// Context handed to the entry stage
    pub seed: Value,
}

impl NewRequest {
    /// Create a request whose seed carries the three descriptive fields
    #[must_use]
    pub fn new(
        subject_id: impl Into<String>,
        objective: impl Into<String>,
        usecase: impl Into<String>,
    ) -> Self {
        let subject_id = subject_id.into();
        let objective = objective.into();
        let usecase = usecase.into();
        let seed = serde_json::json!({
            "subject_id": subject_id,
            "objective": objective,
            "usecase": usecase,
        });
        Self {
            subject_id,
            objective,
            usecase,
            seed,
        }
    }

    /// Replace the seed context
    #[inline]
    #[must_use]
    pub fn with_seed(mut self, seed: Value) -> Self {
        self.seed = seed;
        self
    }
}

/// One experiment intent
///
/// `phase` is a coarse cursor for dashboards. It never drives resumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Identifier
    pub id: RequestId,
    /// Subject entity
    pub subject_id: String,
    /// Free-text objective
    pub objective: String,
    /// Free-text use case
    pub usecase: String,
    /// Per-subject sequence number, starting at 1
    pub sequence: u64,
    /// Last stage entered, `completed` or `<stage>_failed`
    pub phase: String,
    /// Seed context
    pub seed: Value,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Request {
    /// Materialize a new request
    #[must_use]
    pub fn from_new(new: NewRequest, sequence: u64, phase: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            subject_id: new.subject_id,
            objective: new.objective,
            usecase: new.usecase,
            sequence,
            phase: phase.into(),
            seed: new.seed,
            created_at: Utc::now(),
        }
    }

    /// Whether the request reached `completed`
    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.phase == PHASE_COMPLETED
    }

    /// Whether the phase reports a halted lineage
    #[inline]
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.phase.ends_with("_failed")
    }
}
