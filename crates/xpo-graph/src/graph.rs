//! Validated stage registry
//!
//! A [`StageGraph`] is assembled once through [`StageGraphBuilder`] and is
//! read-only afterwards. Validation runs the successor links through a
//! `petgraph` digraph to reject cycles and joins before the straight-line
//! chain is walked from the entry stage.

use crate::error::GraphError;
use crate::stage::{StageDefinition, StageId};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

/// Builder for [`StageGraph`]
#[derive(Debug, Clone)]
pub struct StageGraphBuilder {
    entry: StageId,
    stages: Vec<StageDefinition>,
}

impl StageGraphBuilder {
    /// Create a builder whose pipeline starts at `entry`
    #[must_use]
    pub fn new(entry: impl Into<StageId>) -> Self {
        Self {
            entry: entry.into(),
            stages: Vec::new(),
        }
    }

    /// Add a stage definition
    #[must_use]
    pub fn stage(mut self, definition: StageDefinition) -> Self {
        self.stages.push(definition);
        self
    }

    /// Add several stage definitions
    #[must_use]
    pub fn stages(mut self, definitions: impl IntoIterator<Item = StageDefinition>) -> Self {
        self.stages.extend(definitions);
        self
    }

    /// Validate and freeze the graph
    ///
    /// # Errors
    ///
    /// Returns the first [`GraphError`] found: duplicate ids, arity
    /// violations, unknown successors, cycles, joins, on-demand stages with
    /// a successor or an approval field on a non-terminal stage.
    pub fn build(self) -> Result<StageGraph, GraphError> {
        let mut stages: HashMap<StageId, StageDefinition> = HashMap::with_capacity(self.stages.len());
        let mut order: Vec<StageId> = Vec::with_capacity(self.stages.len());

        for def in self.stages {
            check_agents(&def)?;
            if stages.contains_key(&def.id) {
                return Err(GraphError::DuplicateStage(def.id.to_string()));
            }
            order.push(def.id.clone());
            stages.insert(def.id.clone(), def);
        }

        if !stages.contains_key(&self.entry) {
            return Err(GraphError::UnknownStage(self.entry.to_string()));
        }

        // Node weights are indices into `order` so the graph stays `Copy`-keyed.
        let index: HashMap<&StageId, usize> = order.iter().enumerate().map(|(i, id)| (id, i)).collect();
        let mut links: DiGraphMap<usize, ()> = DiGraphMap::new();
        for (i, id) in order.iter().enumerate() {
            links.add_node(i);
            if let Some(next) = &stages[id].next {
                let Some(&j) = index.get(next) else {
                    return Err(GraphError::UnknownSuccessor {
                        stage: id.to_string(),
                        next: next.to_string(),
                    });
                };
                links.add_edge(i, j, ());
            }
        }

        if petgraph::algo::is_cyclic_directed(&links) {
            return Err(GraphError::Cycle);
        }
        for (i, id) in order.iter().enumerate() {
            if links.neighbors_directed(i, Direction::Incoming).count() > 1 {
                return Err(GraphError::Join(id.to_string()));
            }
        }

        let mut chain = Vec::new();
        let mut cursor = Some(&self.entry);
        while let Some(id) = cursor {
            chain.push(id.clone());
            cursor = stages[id].next.as_ref();
        }
        let rank: HashMap<StageId, usize> = chain.iter().cloned().enumerate().map(|(i, id)| (id, i)).collect();

        for id in &order {
            let def = &stages[id];
            if !rank.contains_key(id) && def.next.is_some() {
                return Err(GraphError::DetachedWithSuccessor(id.to_string()));
            }
            if def.approval_field.is_some() && !def.is_terminal() {
                return Err(GraphError::ApprovalOnNonTerminal(id.to_string()));
            }
        }

        let on_demand = order.into_iter().filter(|id| !rank.contains_key(id)).collect();

        Ok(StageGraph {
            entry: self.entry,
            stages,
            chain,
            rank,
            on_demand,
        })
    }
}

fn check_agents(def: &StageDefinition) -> Result<(), GraphError> {
    if !def.merge.accepts_agent_count(def.agents.len()) {
        return Err(GraphError::InvalidArity {
            stage: def.id.to_string(),
            policy: def.merge.name(),
            count: def.agents.len(),
        });
    }
    let mut seen = BTreeSet::new();
    for agent in &def.agents {
        if agent.trim().is_empty() {
            return Err(GraphError::EmptyAgentName(def.id.to_string()));
        }
        if !seen.insert(agent.as_str()) {
            return Err(GraphError::DuplicateAgent {
                stage: def.id.to_string(),
                agent: agent.clone(),
            });
        }
    }
    Ok(())
}

/// Static, validated registry of stages
///
/// Stages reachable from the entry form the main chain; every other stage is
/// on-demand and has no successor.
#[derive(Debug, Clone)]
pub struct StageGraph {
    entry: StageId,
    stages: HashMap<StageId, StageDefinition>,
    chain: Vec<StageId>,
    rank: HashMap<StageId, usize>,
    on_demand: Vec<StageId>,
}

impl StageGraph {
    /// Create a builder
    #[inline]
    #[must_use]
    pub fn builder(entry: impl Into<StageId>) -> StageGraphBuilder {
        StageGraphBuilder::new(entry)
    }

    /// Definition of `stage`
    ///
    /// # Errors
    ///
    /// [`GraphError::UnknownStage`] when the id is not registered.
    pub fn definition_for(&self, stage: &str) -> Result<&StageDefinition, GraphError> {
        self.stages
            .get(stage)
            .ok_or_else(|| GraphError::UnknownStage(stage.to_string()))
    }

    /// Entry stage of the main chain
    #[inline]
    #[must_use]
    pub fn first_stage(&self) -> &StageId {
        &self.entry
    }

    /// Successor of `stage`, `None` when it is terminal or on-demand
    ///
    /// # Errors
    ///
    /// [`GraphError::UnknownStage`] when the id is not registered.
    pub fn next_stage(&self, stage: &str) -> Result<Option<&StageId>, GraphError> {
        Ok(self.definition_for(stage)?.next.as_ref())
    }

    /// Main chain, entry first
    #[must_use]
    pub fn chain(&self) -> &[StageId] {
        &self.chain
    }

    /// Last stage of the main chain
    #[must_use]
    pub fn terminal_stage(&self) -> &StageId {
        // The chain always holds at least the entry stage.
        self.chain.last().unwrap_or(&self.entry)
    }

    /// Position of `stage` in the main chain
    #[must_use]
    pub fn rank(&self, stage: &str) -> Option<usize> {
        self.rank.get(stage).copied()
    }

    /// Whether `stage` is the terminal stage of the main chain
    #[must_use]
    pub fn is_terminal(&self, stage: &str) -> bool {
        self.terminal_stage().as_str() == stage
    }

    /// Whether `stage` is registered but not reachable from the entry
    #[must_use]
    pub fn is_on_demand(&self, stage: &str) -> bool {
        self.stages.contains_key(stage) && !self.rank.contains_key(stage)
    }

    /// On-demand stages, in registration order
    pub fn on_demand_stages(&self) -> impl Iterator<Item = &StageId> {
        self.on_demand.iter()
    }

    /// Whether `phase` is a stage id, `completed` or `<stage>_failed`
    #[must_use]
    pub fn is_valid_phase(&self, phase: &str) -> bool {
        if phase == "completed" || self.stages.contains_key(phase) {
            return true;
        }
        phase
            .strip_suffix("_failed")
            .is_some_and(|stage| self.stages.contains_key(stage))
    }

    /// Every agent name bound by any stage
    #[must_use]
    pub fn agent_names(&self) -> BTreeSet<&str> {
        self.stages
            .values()
            .flat_map(|def| def.agents.iter().map(String::as_str))
            .collect()
    }

    /// Number of registered stages
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always `false` for a built graph
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
