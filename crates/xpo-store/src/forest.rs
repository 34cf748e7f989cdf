//! Read-only projection of a request's run forest
//!
//! Lineages are not stored. They are derived here by following parent
//! pointers from every live leaf back to its root.

use crate::ids::{RequestId, RunId};
use crate::run::{Run, RunStatus};
use serde::Serialize;
use std::collections::HashMap;
use xpo_graph::StageGraph;

/// All runs of one request, indexed by parent
#[derive(Debug, Clone, Serialize)]
pub struct RunForest {
    request_id: RequestId,
    runs: Vec<Run>,
    #[serde(skip)]
    index: HashMap<RunId, usize>,
    #[serde(skip)]
    children: HashMap<RunId, Vec<usize>>,
}

/// One root-to-leaf path
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lineage {
    /// Runs, root first
    pub runs: Vec<Run>,
}

impl Lineage {
    /// Last run of the path
    #[must_use]
    pub fn leaf(&self) -> Option<&Run> {
        self.runs.last()
    }

    /// Stage ids along the path
    #[must_use]
    pub fn stages(&self) -> Vec<&str> {
        self.runs.iter().map(|r| r.stage.as_str()).collect()
    }
}

/// Counters for dashboards
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForestSummary {
    /// Runs recorded, superseded attempts included
    pub runs: usize,
    /// Live lineages
    pub lineages: usize,
    /// Lineages with nothing left to run
    pub finished: usize,
    /// Lineages halted by a fatal failure
    pub failed: usize,
    /// Mean progress along the main chain, in percent
    pub progress_percent: f64,
}

impl RunForest {
    /// Build the projection; runs are ordered by creation time
    #[must_use]
    pub fn new(request_id: RequestId, mut runs: Vec<Run>) -> Self {
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let index = runs.iter().enumerate().map(|(i, r)| (r.id, i)).collect();
        let mut children: HashMap<RunId, Vec<usize>> = HashMap::new();
        for (i, run) in runs.iter().enumerate() {
            if let Some(parent) = run.parent {
                children.entry(parent).or_default().push(i);
            }
        }
        Self {
            request_id,
            runs,
            index,
            children,
        }
    }

    /// Owning request
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Every run, oldest first
    #[must_use]
    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    /// Number of runs
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Whether nothing ran yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Look up a run
    #[must_use]
    pub fn get(&self, id: RunId) -> Option<&Run> {
        self.index.get(&id).map(|&i| &self.runs[i])
    }

    /// Runs without a parent
    pub fn roots(&self) -> impl Iterator<Item = &Run> {
        self.runs.iter().filter(|r| r.parent.is_none())
    }

    /// Direct children of `id`
    #[must_use]
    pub fn children(&self, id: RunId) -> Vec<&Run> {
        self.children
            .get(&id)
            .map(|idx| idx.iter().map(|&i| &self.runs[i]).collect())
            .unwrap_or_default()
    }

    /// Runs with no recorded child, superseded attempts included
    #[must_use]
    pub fn leaves(&self) -> Vec<&Run> {
        self.runs
            .iter()
            .filter(|r| !self.children.contains_key(&r.id))
            .collect()
    }

    /// Whether a later attempt replaced this failed run
    #[must_use]
    pub fn is_superseded(&self, run: &Run) -> bool {
        if run.status != RunStatus::Failed {
            return false;
        }
        self.runs.iter().any(|other| {
            other.id != run.id
                && other.request_id == run.request_id
                && other.parent == run.parent
                && other.stage == run.stage
                && (other.is_completed() || other.attempt > run.attempt)
        })
    }

    /// Leaves that still define a lineage
    #[must_use]
    pub fn live_leaves(&self) -> Vec<&Run> {
        self.leaves()
            .into_iter()
            .filter(|r| !self.is_superseded(r))
            .collect()
    }

    /// Failed leaves not yet replaced by a retry
    #[must_use]
    pub fn open_failures(&self) -> Vec<&Run> {
        self.live_leaves().into_iter().filter(|r| r.is_failed()).collect()
    }

    /// Completed leaves that still have a stage to run
    #[must_use]
    pub fn pending_leaves(&self, graph: &StageGraph) -> Vec<&Run> {
        self.live_leaves()
            .into_iter()
            .filter(|r| r.is_completed() && !is_finished(r, graph))
            .collect()
    }

    /// Root-to-run path ending at `id`
    #[must_use]
    pub fn chain(&self, id: RunId) -> Vec<&Run> {
        let mut path = Vec::new();
        let mut cursor = self.get(id);
        while let Some(run) = cursor {
            path.push(run);
            cursor = run.parent.and_then(|p| self.get(p));
        }
        path.reverse();
        path
    }

    /// One lineage per live leaf
    #[must_use]
    pub fn lineages(&self) -> Vec<Lineage> {
        self.live_leaves()
            .into_iter()
            .map(|leaf| Lineage {
                runs: self.chain(leaf.id).into_iter().cloned().collect(),
            })
            .collect()
    }

    /// Counters over the live lineages
    #[must_use]
    pub fn summary(&self, graph: &StageGraph) -> ForestSummary {
        let leaves = self.live_leaves();
        let chain_len = graph.chain().len().max(1);
        let mut finished = 0;
        let mut failed = 0;
        let mut progress = 0.0;

        for leaf in &leaves {
            if leaf.is_failed() {
                failed += 1;
                progress += ratio(graph.rank(leaf.stage.as_str()).unwrap_or(0), chain_len);
            } else if is_finished(leaf, graph) {
                finished += 1;
                progress += 1.0;
            } else {
                let done = graph.rank(leaf.stage.as_str()).map_or(0, |r| r + 1);
                progress += ratio(done, chain_len);
            }
        }

        let progress_percent = if leaves.is_empty() {
            0.0
        } else {
            progress * 100.0 / ratio(leaves.len(), 1)
        };

        ForestSummary {
            runs: self.runs.len(),
            lineages: leaves.len(),
            finished,
            failed,
            progress_percent,
        }
    }
}

/// Whether a completed leaf has no further stage to run
#[must_use]
pub fn is_finished(run: &Run, graph: &StageGraph) -> bool {
    run.is_completed()
        && (run.lineage_end.is_some() || matches!(graph.next_stage(run.stage.as_str()), Ok(None)))
}

#[allow(clippy::cast_precision_loss)]
fn ratio(num: usize, den: usize) -> f64 {
    num as f64 / den as f64
}
