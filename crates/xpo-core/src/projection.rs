//! Coarse phase projection
//!
//! Derives the request phase from the run forest. The forest is the source
//! of truth; the phase is only a cursor for dashboards.

use xpo_graph::StageGraph;
use xpo_store::{is_finished, RunForest, PHASE_COMPLETED};

/// Phase for `forest`, `None` while nothing ran
///
/// - any open failure: `<earliest failed stage>_failed`
/// - every lineage finished: the latest on-demand stage reached, else `completed`
/// - otherwise: the most advanced stage among pending lineages
#[must_use]
pub fn project_phase(forest: &RunForest, graph: &StageGraph) -> Option<String> {
    if forest.is_empty() {
        return None;
    }
    let order = |stage: &str| graph.rank(stage).unwrap_or(usize::MAX);

    if let Some(failed) = forest
        .open_failures()
        .into_iter()
        .min_by_key(|run| order(run.stage.as_str()))
    {
        return Some(failed.stage.failed_phase());
    }

    let live = forest.live_leaves();
    let pending: Vec<_> = live.iter().filter(|run| !is_finished(run, graph)).collect();
    if pending.is_empty() {
        let on_demand = live
            .iter()
            .filter(|run| graph.is_on_demand(run.stage.as_str()))
            .max_by_key(|run| run.created_at);
        return Some(on_demand.map_or_else(|| PHASE_COMPLETED.to_string(), |run| run.stage.to_string()));
    }

    pending
        .into_iter()
        .max_by_key(|run| order(run.stage.as_str()))
        .map(|run| run.stage.to_string())
}
