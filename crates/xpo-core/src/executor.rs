//! Pipeline executor
//!
//! Walks the stage graph for one request. Every open lineage tip is a
//! [`Step`]: run the stage's agents on the tip's output, append the
//! resulting runs, and schedule the next stage for each new completed run.
//! Steps of independent lineages run concurrently on a `JoinSet`, bounded by
//! a semaphore.
//!
//! # Failure handling
//!
//! - soft agent error: recorded as an error marker in the output, lineage continues
//! - fatal agent error or timeout: one failed run, that lineage halts
//! - persistence error: every in-flight step is aborted and the call fails;
//!   nothing half-written is left because each append is atomic
//!
//! # Idempotency
//!
//! A step is keyed by `(request, parent, stage)`. The executor claims the
//! key in-process while the step runs, skips keys whose slot already holds a
//! completed run, and treats a store conflict on append as "someone else
//! recorded this step".

use crate::agent::{AgentInvoker, AgentOutcome};
use crate::config::ExecutorConfig;
use crate::error::{AgentError, PipelineError};
use crate::merge::{self, Contribution, Settled};
use crate::projection::project_phase;
use crate::registry::AgentRegistry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;
use xpo_graph::{MergePolicy, StageDefinition, StageGraph, StageId};
use xpo_store::{
    input_digest, is_finished, FlagUpdate, InvocationId, LineageEnd, Request, RequestId, Run, RunDraft, RunForest,
    StepAudit, StepKey, StoreError, Stores,
};

/// One unit of scheduled work: run `key.stage` on `input`
#[derive(Debug, Clone)]
struct Step {
    key: StepKey,
    input: Value,
}

impl Step {
    fn root(request: &Request, stage: StageId) -> Self {
        Self {
            key: StepKey::new(request.id, None, stage),
            input: request.seed.clone(),
        }
    }

    fn after(run: &Run, stage: StageId) -> Self {
        Self {
            key: StepKey::new(run.request_id, Some(run.id), stage),
            input: run.output.clone(),
        }
    }

    fn retry_of(failed: &Run) -> Self {
        Self {
            key: failed.step_key(),
            input: failed.input.clone(),
        }
    }
}

/// Per-call state shared by the steps of one invocation
struct Invocation {
    id: InvocationId,
    request: Request,
    halted: AtomicBool,
}

/// Result of running a stage's agents
struct StageResult {
    drafts: Vec<RunDraft>,
    conflicts: Vec<String>,
    fatal: bool,
}

struct Inner {
    graph: Arc<StageGraph>,
    agents: AgentRegistry,
    stores: Stores,
    config: ExecutorConfig,
    claims: DashMap<StepKey, InvocationId>,
    permits: Arc<Semaphore>,
}

/// Removes a step claim when the step ends, however it ends
struct Claim<'a> {
    claims: &'a DashMap<StepKey, InvocationId>,
    key: StepKey,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.key);
    }
}

/// Executes requests against a stage graph
///
/// Cheap to clone; clones share claims and the concurrency limit, so
/// concurrent `start`/`resume` calls for one request never run a step twice.
#[derive(Clone)]
pub struct PipelineExecutor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("stages", &self.inner.graph.len())
            .field("agents", &self.inner.agents)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl PipelineExecutor {
    /// Create an executor
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] when a stage binds an unregistered
    /// agent or the creation phase is not a phase of `graph`.
    pub fn new(
        graph: Arc<StageGraph>,
        agents: AgentRegistry,
        stores: Stores,
        config: ExecutorConfig,
    ) -> Result<Self, PipelineError> {
        agents.ensure_covers(&graph)?;
        if let Some(phase) = &config.default_phase_on_create {
            if !graph.is_valid_phase(phase) {
                return Err(PipelineError::configuration(format!(
                    "creation phase {phase} is neither a stage, completed nor <stage>_failed"
                )));
            }
        }
        let permits = Arc::new(Semaphore::new(config.max_concurrent_lineages.max(1)));
        Ok(Self {
            inner: Arc::new(Inner {
                graph,
                agents,
                stores,
                config,
                claims: DashMap::new(),
                permits,
            }),
        })
    }

    /// Stage graph
    #[must_use]
    pub fn graph(&self) -> &Arc<StageGraph> {
        &self.inner.graph
    }

    /// Stores
    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Run a request from its entry stage
    ///
    /// On a request that already has runs this behaves like [`resume`](Self::resume).
    ///
    /// # Errors
    ///
    /// [`PipelineError::RequestNotFound`] or a persistence failure.
    pub async fn start(&self, request_id: RequestId) -> Result<RunForest, PipelineError> {
        let request = self.inner.stores.requests.get(request_id).await?;
        let existing = self.inner.stores.lineage.runs_for(request_id).await?;
        if !existing.is_empty() {
            tracing::info!(request = %request_id, "request already started, resuming");
            return self.resume(request_id).await;
        }
        tracing::info!(request = %request_id, subject = %request.subject_id, "starting pipeline");
        let entry = self.inner.graph.first_stage().clone();
        let steps = vec![Step::root(&request, entry)];
        self.run_invocation(request, steps).await
    }

    /// Advance every completed, unfinished leaf
    ///
    /// Failed leaves are left alone; see [`retry_failed`](Self::retry_failed).
    ///
    /// # Errors
    ///
    /// [`PipelineError::RequestNotFound`] or a persistence failure.
    pub async fn resume(&self, request_id: RequestId) -> Result<RunForest, PipelineError> {
        let request = self.inner.stores.requests.get(request_id).await?;
        let leaves = self.inner.stores.lineage.latest_leaves(request_id).await?;
        if leaves.is_empty() {
            let entry = self.inner.graph.first_stage().clone();
            return self.run_invocation(request.clone(), vec![Step::root(&request, entry)]).await;
        }

        let steps = self.pending_steps(leaves.iter());
        tracing::info!(request = %request_id, tips = steps.len(), "resuming pipeline");
        self.run_invocation(request, steps).await
    }

    /// Re-run every failed step that has not been replaced, then resume
    ///
    /// # Errors
    ///
    /// [`PipelineError::RequestNotFound`] or a persistence failure.
    pub async fn retry_failed(&self, request_id: RequestId) -> Result<RunForest, PipelineError> {
        let request = self.inner.stores.requests.get(request_id).await?;
        let forest = RunForest::new(request_id, self.inner.stores.lineage.runs_for(request_id).await?);
        if forest.is_empty() {
            let entry = self.inner.graph.first_stage().clone();
            return self.run_invocation(request.clone(), vec![Step::root(&request, entry)]).await;
        }

        let mut steps: Vec<Step> = forest.open_failures().into_iter().map(Step::retry_of).collect();
        let retried = steps.len();
        steps.extend(self.pending_steps(forest.live_leaves().into_iter()));
        tracing::info!(request = %request_id, retried, tips = steps.len(), "retrying failed lineages");
        self.run_invocation(request, steps).await
    }

    /// Run an on-demand `stage` as a child of each of `parents`
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] when `stage` is not an on-demand
    /// stage, [`PipelineError::RequestNotFound`] or a persistence failure.
    pub async fn run_on_demand(
        &self,
        request_id: RequestId,
        stage: &str,
        parents: &[Run],
    ) -> Result<RunForest, PipelineError> {
        if !self.inner.graph.is_on_demand(stage) {
            return Err(PipelineError::configuration(format!("{stage} is not an on-demand stage")));
        }
        let request = self.inner.stores.requests.get(request_id).await?;
        let stage = StageId::from(stage);
        let steps = parents
            .iter()
            .filter(|run| run.request_id == request_id)
            .map(|run| Step::after(run, stage.clone()))
            .collect();
        self.run_invocation(request, steps).await
    }

    fn pending_steps<'a>(&self, leaves: impl Iterator<Item = &'a Run>) -> Vec<Step> {
        leaves
            .filter(|run| run.is_completed() && !is_finished(run, &self.inner.graph))
            .filter_map(|run| match self.inner.graph.next_stage(run.stage.as_str()) {
                Ok(Some(next)) => Some(Step::after(run, next.clone())),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(run = %run.id, error = %e, "leaf names a stage missing from the graph");
                    None
                }
            })
            .collect()
    }

    async fn run_invocation(&self, request: Request, steps: Vec<Step>) -> Result<RunForest, PipelineError> {
        let request_id = request.id;
        let invocation = Arc::new(Invocation {
            id: InvocationId::new(),
            request,
            halted: AtomicBool::new(false),
        });

        self.drive(&invocation, steps).await?;

        let forest = RunForest::new(request_id, self.inner.stores.lineage.runs_for(request_id).await?);
        if let Some(phase) = project_phase(&forest, &self.inner.graph) {
            self.inner.stores.requests.set_phase(request_id, &phase).await?;
            tracing::info!(request = %request_id, %phase, runs = forest.len(), "invocation settled");
        }
        Ok(forest)
    }

    async fn drive(&self, invocation: &Arc<Invocation>, steps: Vec<Step>) -> Result<(), PipelineError> {
        let mut tasks = JoinSet::new();
        for step in steps {
            self.spawn_step(&mut tasks, invocation, step);
        }

        while let Some(joined) = tasks.join_next().await {
            let next = match joined {
                Ok(Ok(next)) => next,
                Ok(Err(err)) => {
                    tracing::error!(request = %invocation.request.id, error = %err, "aborting invocation");
                    tasks.abort_all();
                    return Err(err);
                }
                Err(join) => {
                    tasks.abort_all();
                    return Err(PipelineError::Join(join.to_string()));
                }
            };
            for step in next {
                self.spawn_step(&mut tasks, invocation, step);
            }
        }
        Ok(())
    }

    fn spawn_step(
        &self,
        tasks: &mut JoinSet<Result<Vec<Step>, PipelineError>>,
        invocation: &Arc<Invocation>,
        step: Step,
    ) {
        let inner = Arc::clone(&self.inner);
        let invocation = Arc::clone(invocation);
        let span = tracing::info_span!("advance", request = %step.key.request_id, stage = %step.key.stage);
        tasks.spawn(async move { advance(&inner, &invocation, step).await }.instrument(span));
    }
}

/// Run one step and return the steps it unlocks
async fn advance(inner: &Inner, invocation: &Invocation, step: Step) -> Result<Vec<Step>, PipelineError> {
    let stage = step.key.stage.clone();
    let def = inner.graph.definition_for(stage.as_str())?;

    let _claim = match inner.claims.entry(step.key.clone()) {
        Entry::Occupied(_) => {
            tracing::debug!("step already in flight, skipping");
            return Ok(Vec::new());
        }
        Entry::Vacant(slot) => {
            slot.insert(invocation.id);
            Claim {
                claims: &inner.claims,
                key: step.key.clone(),
            }
        }
    };

    let digest = input_digest(&step.input);
    let recorded = inner.stores.lineage.slot(&step.key).await?;
    if let Some(done) = recorded.iter().find(|run| !run.is_failed()) {
        if done.input_digest != digest {
            tracing::warn!(run = %done.id, "slot holds a run built from a different input");
        }
        tracing::info!("step already recorded, skipping");
        return Ok(Vec::new());
    }

    if !invocation.halted.load(Ordering::SeqCst) {
        inner.stores.requests.set_phase(step.key.request_id, stage.as_str()).await?;
    }

    let permit = inner
        .permits
        .acquire()
        .await
        .map_err(|e| PipelineError::Join(e.to_string()))?;
    let result = run_stage(inner, def, &step.input).await?;
    drop(permit);

    let runs = match inner.stores.lineage.append_children(&step.key, result.drafts).await {
        Ok(runs) => runs,
        Err(StoreError::Conflict { .. }) => {
            tracing::info!("step recorded concurrently, skipping");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err.into()),
    };

    record_audit(inner, invocation, &step, &runs, result.conflicts).await;

    if result.fatal {
        invocation.halted.store(true, Ordering::SeqCst);
        inner
            .stores
            .requests
            .set_phase(step.key.request_id, &stage.failed_phase())
            .await?;
        for run in &runs {
            tracing::error!(run = %run.id, "lineage halted");
        }
        return Ok(Vec::new());
    }

    if def.merge == MergePolicy::FanOut {
        tracing::info!(branches = runs.len(), "fan-out produced lineages");
    }

    let mut next_steps = Vec::new();
    for run in &runs {
        if run.lineage_end.is_some() {
            continue;
        }
        if let Some(field) = &def.approval_field {
            grant_approval(inner, run, field).await?;
        }
        if let Some(next) = &def.next {
            next_steps.push(Step::after(run, next.clone()));
        }
    }
    Ok(next_steps)
}

async fn grant_approval(inner: &Inner, run: &Run, field: &str) -> Result<(), PipelineError> {
    if !merge::approval_granted(&run.output, field) {
        return Ok(());
    }
    match inner.stores.lineage.set_terminal_flags(run.id, FlagUpdate::Approve).await {
        Ok(_) => {
            tracing::info!(run = %run.id, "deployment approval granted");
            Ok(())
        }
        Err(StoreError::InvalidUpdate { reason, .. }) => {
            tracing::warn!(run = %run.id, %reason, "approval not recorded");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn record_audit(inner: &Inner, invocation: &Invocation, step: &Step, runs: &[Run], conflicts: Vec<String>) {
    let graph = &inner.graph;
    let order = graph.rank(step.key.stage.as_str()).unwrap_or(graph.chain().len()) + 1;
    let output = match runs {
        [single] => single.output.clone(),
        many => Value::Array(many.iter().map(|r| r.output.clone()).collect()),
    };
    let entry = StepAudit::new(
        invocation.id,
        step.key.stage.as_str(),
        u32::try_from(order).unwrap_or(u32::MAX),
        invocation.request.subject_id.as_str(),
        step.input.clone(),
        output,
    )
    .with_conflicts(conflicts);

    if let Err(err) = inner.stores.audit.record(entry).await {
        tracing::warn!(error = %err, "step audit not recorded");
    }
}

/// Invoke one agent, bounded by the configured timeout
async fn call(inner: &Inner, agent: &dyn AgentInvoker, input: &Value) -> Result<AgentOutcome, AgentError> {
    let timeout = inner.config.agent_timeout();
    match tokio::time::timeout(timeout, agent.invoke(input)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(AgentError::fatal(format!(
            "agent {} timed out after {}ms",
            agent.name(),
            timeout.as_millis()
        ))),
    }
}

fn lookup(inner: &Inner, name: &str) -> Result<Arc<dyn AgentInvoker>, PipelineError> {
    inner
        .agents
        .get(name)
        .ok_or_else(|| PipelineError::configuration(format!("no agent registered for {name}")))
}

fn fatal(input: &Value, agent: &str, stage: &str, message: &str) -> StageResult {
    tracing::error!(agent, message, "fatal agent error");
    StageResult {
        drafts: vec![RunDraft::failed(
            input.clone(),
            merge::error_marker("fatal", agent, stage, message),
        )],
        conflicts: Vec::new(),
        fatal: true,
    }
}

fn completed(drafts: Vec<RunDraft>) -> StageResult {
    StageResult {
        drafts,
        conflicts: Vec::new(),
        fatal: false,
    }
}

async fn run_stage(inner: &Inner, def: &StageDefinition, input: &Value) -> Result<StageResult, PipelineError> {
    let stage = def.id.as_str();
    match def.merge {
        MergePolicy::Single => {
            let agent = lookup(inner, &def.agents[0])?;
            Ok(match call(inner, agent.as_ref(), input).await {
                Ok(AgentOutcome::Single(value)) => completed(vec![RunDraft::completed(input.clone(), value)]),
                Ok(AgentOutcome::Branches(branches)) => fatal(
                    input,
                    agent.name(),
                    stage,
                    &format!("returned {} branches at a single-outcome stage", branches.len()),
                ),
                Err(AgentError::Soft(message)) => {
                    tracing::warn!(agent = agent.name(), %message, "soft agent error, continuing degraded");
                    let degraded = merge::degrade(input, agent.output_field(), agent.name(), stage, &message);
                    completed(vec![RunDraft::completed(input.clone(), degraded)])
                }
                Err(AgentError::Fatal(message)) => fatal(input, agent.name(), stage, &message),
            })
        }
        MergePolicy::FanOut => {
            let agent = lookup(inner, &def.agents[0])?;
            Ok(match call(inner, agent.as_ref(), input).await {
                Ok(outcome) => {
                    let branches = outcome.into_branches();
                    if branches.is_empty() {
                        tracing::info!(agent = agent.name(), "fan-out produced no branches, lineage ends");
                        completed(vec![RunDraft::completed(input.clone(), input.clone())
                            .with_lineage_end(LineageEnd::NoBranches)])
                    } else {
                        completed(
                            branches
                                .into_iter()
                                .enumerate()
                                .map(|(i, value)| {
                                    RunDraft::completed(input.clone(), value)
                                        .with_branch_index(u32::try_from(i).unwrap_or(u32::MAX))
                                })
                                .collect(),
                        )
                    }
                }
                Err(AgentError::Soft(message)) => {
                    tracing::warn!(agent = agent.name(), %message, "soft agent error, continuing degraded");
                    let degraded = merge::degrade(input, agent.output_field(), agent.name(), stage, &message);
                    completed(vec![RunDraft::completed(input.clone(), degraded)])
                }
                Err(AgentError::Fatal(message)) => fatal(input, agent.name(), stage, &message),
            })
        }
        MergePolicy::ParallelMerge => {
            let agents = def
                .agents
                .iter()
                .map(|name| lookup(inner, name))
                .collect::<Result<Vec<_>, _>>()?;

            // Fan-in barrier: every agent settles before anything is merged.
            let outcomes =
                futures::future::join_all(agents.iter().map(|agent| call(inner, agent.as_ref(), input))).await;

            let mut settled = Vec::with_capacity(agents.len());
            for (agent, outcome) in agents.iter().zip(outcomes) {
                let contribution = match outcome {
                    Ok(AgentOutcome::Single(value)) => Contribution::Value(value),
                    Ok(AgentOutcome::Branches(branches)) => {
                        return Ok(fatal(
                            input,
                            agent.name(),
                            stage,
                            &format!("returned {} branches at a parallel-merge stage", branches.len()),
                        ));
                    }
                    Err(AgentError::Soft(message)) => {
                        tracing::warn!(agent = agent.name(), %message, "soft agent error, continuing degraded");
                        Contribution::Soft(message)
                    }
                    Err(AgentError::Fatal(message)) => return Ok(fatal(input, agent.name(), stage, &message)),
                };
                settled.push(Settled {
                    agent: agent.name().to_string(),
                    output_field: agent.output_field().to_string(),
                    contribution,
                });
            }

            let merged = merge::merge_parallel(input, stage, &settled);
            let conflicts: Vec<String> = merged.conflicts.iter().map(ToString::to_string).collect();
            for conflict in &conflicts {
                tracing::warn!(%conflict, "parallel merge conflict");
            }
            Ok(StageResult {
                drafts: vec![RunDraft::completed(input.clone(), merged.output)],
                conflicts,
                fatal: false,
            })
        }
    }
}
