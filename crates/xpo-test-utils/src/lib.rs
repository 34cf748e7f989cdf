//! Testing utilities for XPO workspace
//!
//! Scripted agents, the pricing graph fixture and executor setup helpers.

#![allow(missing_docs)]

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use xpo_core::{AgentError, AgentInvoker, AgentOutcome, AgentRegistry, ExecutorConfig, PipelineExecutor};
use xpo_graph::{StageDefinition, StageGraph};
use xpo_store::{MemoryStore, NewRequest, Request, RequestStore, Stores};

pub const SEGMENTS: &str = "segments_loaded";
pub const POSITIONING: &str = "positioning_usage_analysis_done";
pub const GAPS: &str = "roi_gap_analyzer_run";
pub const PLAN: &str = "experimental_plan_generated";
pub const SIMULATIONS: &str = "simulations_run";
pub const SCENARIOS: &str = "scenario_builder_completed";
pub const CASHFLOW: &str = "cashflow_feasibility_runs_completed";
pub const FEEDBACK: &str = "feedback_collected";
pub const APPROVAL_FIELD: &str = "cashflow_no_negative_impact_approval_given";

type Script = dyn Fn(&Value, usize) -> Result<AgentOutcome, AgentError> + Send + Sync;
type Delay = dyn Fn(&Value) -> Duration + Send + Sync;

/// Agent driven by a closure over `(input, call number)`
pub struct ScriptedAgent {
    name: String,
    output_field: String,
    script: Box<Script>,
    delay: Box<Delay>,
    calls: AtomicUsize,
}

impl std::fmt::Debug for ScriptedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedAgent")
            .field("name", &self.name)
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

/// `input` with `field` set to `value`
pub fn annotate(input: &Value, field: &str, value: Value) -> Value {
    let mut map = match input {
        Value::Object(m) => m.clone(),
        _ => Map::new(),
    };
    map.insert(field.to_string(), value);
    Value::Object(map)
}

impl ScriptedAgent {
    pub fn from_fn<F>(name: &str, script: F) -> Self
    where
        F: Fn(&Value, usize) -> Result<AgentOutcome, AgentError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            output_field: name.to_string(),
            script: Box::new(script),
            delay: Box::new(|_| Duration::ZERO),
            calls: AtomicUsize::new(0),
        }
    }

    /// Writes `value` into its own field of the input
    pub fn annotating(name: &str, value: Value) -> Self {
        let field = name.to_string();
        Self::from_fn(name, move |input, _| Ok(AgentOutcome::Single(annotate(input, &field, value.clone()))))
    }

    /// Returns one annotated branch per value
    pub fn fan_out(name: &str, branches: Vec<Value>) -> Self {
        let field = name.to_string();
        Self::from_fn(name, move |input, _| {
            Ok(AgentOutcome::Branches(
                branches.iter().map(|b| annotate(input, &field, b.clone())).collect(),
            ))
        })
    }

    pub fn soft(name: &str, message: &str) -> Self {
        let message = message.to_string();
        Self::from_fn(name, move |_, _| Err(AgentError::soft(message.clone())))
    }

    pub fn fatal(name: &str, message: &str) -> Self {
        let message = message.to_string();
        Self::from_fn(name, move |_, _| Err(AgentError::fatal(message.clone())))
    }

    /// Fails fatally on the first `failures` calls, then annotates
    pub fn flaky(name: &str, failures: usize, value: Value) -> Self {
        let field = name.to_string();
        Self::from_fn(name, move |input, call| {
            if call < failures {
                Err(AgentError::fatal(format!("transient failure {}", call + 1)))
            } else {
                Ok(AgentOutcome::Single(annotate(input, &field, value.clone())))
            }
        })
    }

    #[must_use]
    pub fn with_output_field(mut self, field: &str) -> Self {
        self.output_field = field.to_string();
        self
    }

    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_delay_when(move |_| delay)
    }

    #[must_use]
    pub fn with_delay_when<F>(mut self, delay: F) -> Self
    where
        F: Fn(&Value) -> Duration + Send + Sync + 'static,
    {
        self.delay = Box::new(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AgentInvoker for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_field(&self) -> &str {
        &self.output_field
    }

    async fn invoke(&self, context: &Value) -> Result<AgentOutcome, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = (self.delay)(context);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        (self.script)(context, call)
    }
}

/// The seven pricing stages plus on-demand feedback
pub fn pricing_graph() -> StageGraph {
    StageGraph::builder(SEGMENTS)
        .stage(StageDefinition::single(SEGMENTS, "segment_selector").then(POSITIONING))
        .stage(StageDefinition::parallel(POSITIONING, ["positioning", "competitor"]).then(GAPS))
        .stage(StageDefinition::fan_out(GAPS, "roi_gap").then(PLAN))
        .stage(StageDefinition::single(PLAN, "planner").then(SIMULATIONS))
        .stage(StageDefinition::fan_out(SIMULATIONS, "simulator").then(SCENARIOS))
        .stage(StageDefinition::parallel(SCENARIOS, ["scenario", "marketing"]).then(CASHFLOW))
        .stage(StageDefinition::single(CASHFLOW, "cashflow").with_approval_field(APPROVAL_FIELD))
        .stage(StageDefinition::single(FEEDBACK, "feedback"))
        .build()
        .unwrap()
}

/// Well-behaved agents for [`pricing_graph`], each one-branch at fan-out stages
pub fn pricing_agents() -> Vec<Arc<ScriptedAgent>> {
    vec![
        Arc::new(ScriptedAgent::annotating("segment_selector", Value::from("smb"))),
        Arc::new(ScriptedAgent::annotating("positioning", Value::from("value-leader"))),
        Arc::new(ScriptedAgent::annotating("competitor", Value::from(vec!["acme"]))),
        Arc::new(ScriptedAgent::fan_out("roi_gap", vec![Value::from("g1")])),
        Arc::new(ScriptedAgent::annotating("planner", Value::from("plan"))),
        Arc::new(ScriptedAgent::fan_out("simulator", vec![Value::from("s1")])),
        Arc::new(ScriptedAgent::annotating("scenario", Value::from("base"))),
        Arc::new(ScriptedAgent::annotating("marketing", Value::from("email"))),
        Arc::new(
            ScriptedAgent::from_fn("cashflow", |input, _| {
                let out = annotate(input, "cashflow", Value::from("positive"));
                Ok(AgentOutcome::Single(annotate(&out, APPROVAL_FIELD, Value::Bool(true))))
            }),
        ),
        Arc::new(ScriptedAgent::annotating("feedback", Value::from("conversion up"))),
    ]
}

/// Registry of `agents`, later entries replacing earlier ones of the same name
pub fn registry(agents: &[Arc<ScriptedAgent>]) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    for agent in agents {
        registry.register(agent.clone());
    }
    registry
}

/// `base` with the agents in `overrides` swapped in by name
pub fn with_overrides(base: Vec<Arc<ScriptedAgent>>, overrides: Vec<Arc<ScriptedAgent>>) -> Vec<Arc<ScriptedAgent>> {
    let mut agents: Vec<_> = base
        .into_iter()
        .filter(|a| !overrides.iter().any(|o| o.name() == a.name()))
        .collect();
    agents.extend(overrides);
    agents
}

/// Short timeout so hanging agents fail fast
pub fn test_config() -> ExecutorConfig {
    ExecutorConfig::new().with_agent_timeout(Duration::from_millis(500))
}

pub fn executor(graph: StageGraph, agents: &[Arc<ScriptedAgent>], stores: Stores) -> PipelineExecutor {
    executor_with(graph, agents, stores, test_config())
}

pub fn executor_with(
    graph: StageGraph,
    agents: &[Arc<ScriptedAgent>],
    stores: Stores,
    config: ExecutorConfig,
) -> PipelineExecutor {
    PipelineExecutor::new(Arc::new(graph), registry(agents), stores, config).unwrap()
}

pub fn memory_stores() -> (Arc<MemoryStore>, Stores) {
    let store = Arc::new(MemoryStore::new());
    (store.clone(), Stores::shared(store))
}

pub async fn seeded_request(requests: &dyn RequestStore) -> Request {
    requests
        .create(NewRequest::new("product-42", "lift margin", "pricing"), SEGMENTS)
        .await
        .unwrap()
}
