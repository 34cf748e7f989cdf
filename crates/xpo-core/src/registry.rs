//! Agent registry
//!
//! Maps agent names used in stage definitions to invokers. Built once and
//! checked against the graph before any request runs.

use crate::agent::AgentInvoker;
use crate::error::PipelineError;
use std::collections::HashMap;
use std::sync::Arc;
use xpo_graph::StageGraph;

/// Named agent invokers
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn AgentInvoker>>,
}

impl AgentRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own name, replacing any previous binding
    pub fn register(&mut self, agent: Arc<dyn AgentInvoker>) -> &mut Self {
        self.agents.insert(agent.name().to_string(), agent);
        self
    }

    /// Builder form of [`register`](Self::register)
    #[must_use]
    pub fn with(mut self, agent: Arc<dyn AgentInvoker>) -> Self {
        self.register(agent);
        self
    }

    /// Look up an agent
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentInvoker>> {
        self.agents.get(name).cloned()
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Fail unless every agent bound in `graph` is registered
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] naming the missing agents.
    pub fn ensure_covers(&self, graph: &StageGraph) -> Result<(), PipelineError> {
        let missing: Vec<&str> = graph
            .agent_names()
            .into_iter()
            .filter(|name| !self.agents.contains_key(*name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::configuration(format!(
                "no agent registered for: {}",
                missing.join(", ")
            )))
        }
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry").field("agents", &self.names()).finish()
    }
}
