//! Inbound triggers
//!
//! [`ExperimentService`] is what an outer surface (HTTP handlers, the CLI)
//! talks to: it creates requests and starts them in the background, serves
//! the run forest, and drives the deployment and feedback lifecycle of
//! approved terminal runs.

use crate::error::PipelineError;
use crate::executor::PipelineExecutor;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use xpo_store::{FlagUpdate, NewRequest, Request, RequestId, Run, RunForest, RunId, PHASE_COMPLETED};

type Background = JoinHandle<Result<RunForest, PipelineError>>;

/// Request lifecycle on top of a [`PipelineExecutor`]
#[derive(Debug)]
pub struct ExperimentService {
    executor: PipelineExecutor,
    background: Arc<DashMap<RequestId, Background>>,
}

impl ExperimentService {
    /// Create a service
    #[must_use]
    pub fn new(executor: PipelineExecutor) -> Self {
        Self {
            executor,
            background: Arc::new(DashMap::new()),
        }
    }

    /// Underlying executor
    #[must_use]
    pub fn executor(&self) -> &PipelineExecutor {
        &self.executor
    }

    /// Create a request and start its pipeline in the background
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// A persistence failure while creating the request.
    pub async fn create_request(
        &self,
        subject_id: &str,
        objective: &str,
        usecase: &str,
    ) -> Result<RequestId, PipelineError> {
        self.create_request_with(NewRequest::new(subject_id, objective, usecase))
            .await
    }

    /// [`create_request`](Self::create_request) with a custom seed
    ///
    /// # Errors
    ///
    /// A persistence failure while creating the request.
    pub async fn create_request_with(&self, new: NewRequest) -> Result<RequestId, PipelineError> {
        let phase = self
            .executor
            .config()
            .default_phase_on_create
            .clone()
            .unwrap_or_else(|| self.executor.graph().first_stage().to_string());
        let request = self.executor.stores().requests.create(new, &phase).await?;
        tracing::info!(
            request = %request.id,
            subject = %request.subject_id,
            sequence = request.sequence,
            "request created"
        );

        let executor = self.executor.clone();
        let background = Arc::clone(&self.background);
        let (registered, on_registered) = oneshot::channel::<()>();
        let id = request.id;
        let handle = tokio::spawn(async move {
            let outcome = executor.start(id).await;
            if let Err(err) = &outcome {
                tracing::error!(request = %id, error = %err, "background pipeline failed");
            }
            // the handle must be in the map before it can be dropped from it
            let _ = on_registered.await;
            background.remove(&id);
            outcome
        });
        self.background.insert(id, handle);
        let _ = registered.send(());
        Ok(id)
    }

    /// Background pipelines still running
    #[must_use]
    pub fn running(&self) -> usize {
        self.background.len()
    }

    /// Wait for the background pipeline started by `create_request`
    ///
    /// Finished pipelines release their handle on their own, so once nothing
    /// is running for `request_id` this returns the stored forest.
    ///
    /// # Errors
    ///
    /// Whatever a still running background pipeline returned,
    /// [`PipelineError::Join`], or a persistence failure.
    pub async fn wait(&self, request_id: RequestId) -> Result<RunForest, PipelineError> {
        match self.background.remove(&request_id) {
            Some((_, handle)) => handle.await.map_err(|e| PipelineError::Join(e.to_string()))?,
            None => self.get_runs(request_id).await,
        }
    }

    /// Fetch a request
    ///
    /// # Errors
    ///
    /// [`PipelineError::RequestNotFound`] or a persistence failure.
    pub async fn get_request(&self, request_id: RequestId) -> Result<Request, PipelineError> {
        Ok(self.executor.stores().requests.get(request_id).await?)
    }

    /// Read-only run forest of a request
    ///
    /// # Errors
    ///
    /// [`PipelineError::RequestNotFound`] or a persistence failure.
    pub async fn get_runs(&self, request_id: RequestId) -> Result<RunForest, PipelineError> {
        let stores = self.executor.stores();
        stores.requests.get(request_id).await?;
        let runs = stores.lineage.runs_for(request_id).await?;
        Ok(RunForest::new(request_id, runs))
    }

    /// Advance every open lineage
    ///
    /// # Errors
    ///
    /// See [`PipelineExecutor::resume`].
    pub async fn resume(&self, request_id: RequestId) -> Result<RunForest, PipelineError> {
        self.executor.resume(request_id).await
    }

    /// Retry failed lineages, then advance the rest
    ///
    /// # Errors
    ///
    /// See [`PipelineExecutor::retry_failed`].
    pub async fn retry_failed(&self, request_id: RequestId) -> Result<RunForest, PipelineError> {
        self.executor.retry_failed(request_id).await
    }

    /// Completed requests holding at least one approved, undeployed terminal leaf
    ///
    /// # Errors
    ///
    /// A persistence failure, or [`PipelineError::RequestNotFound`] for an
    /// unknown `filter`.
    pub async fn completed_and_approved(&self, filter: Option<RequestId>) -> Result<Vec<Request>, PipelineError> {
        let stores = self.executor.stores();
        let candidates = match filter {
            Some(id) => vec![stores.requests.get(id).await?],
            None => stores.requests.list().await?,
        };

        let mut ready = Vec::new();
        for request in candidates.into_iter().filter(|r| r.phase == PHASE_COMPLETED) {
            let forest = RunForest::new(request.id, stores.lineage.runs_for(request.id).await?);
            if !self.deployable(&forest).is_empty() {
                ready.push(request);
            }
        }
        Ok(ready)
    }

    /// Approved, undeployed terminal leaves of a forest
    #[must_use]
    pub fn deployable<'a>(&self, forest: &'a RunForest) -> Vec<&'a Run> {
        let graph = self.executor.graph();
        forest
            .live_leaves()
            .into_iter()
            .filter(|run| run.is_completed() && graph.is_terminal(run.stage.as_str()))
            .filter(|run| run.flags.approved && run.flags.deployed_at.is_none())
            .collect()
    }

    /// Record that the approved terminal run `run_id` was deployed
    ///
    /// # Errors
    ///
    /// [`PipelineError::Deployment`] when the run belongs to another request,
    /// is not at the terminal stage, or the store rejects the flag (not
    /// approved, superseded, already deployed).
    pub async fn mark_deployed(&self, request_id: RequestId, run_id: RunId) -> Result<Run, PipelineError> {
        let lineage = &self.executor.stores().lineage;
        let run = lineage.get_run(run_id).await?;
        if run.request_id != request_id {
            return Err(PipelineError::Deployment(format!(
                "run {run_id} does not belong to request {request_id}"
            )));
        }
        if !self.executor.graph().is_terminal(run.stage.as_str()) {
            return Err(PipelineError::Deployment(format!(
                "run {run_id} is at {}, not the terminal stage",
                run.stage
            )));
        }

        match lineage.set_terminal_flags(run_id, FlagUpdate::Deploy(Utc::now())).await {
            Ok(run) => {
                tracing::info!(request = %request_id, run = %run_id, "run marked deployed");
                Ok(run)
            }
            Err(xpo_store::StoreError::InvalidUpdate { reason, .. }) => Err(PipelineError::Deployment(reason)),
            Err(err) => Err(err.into()),
        }
    }

    /// Run the feedback stage against every deployed terminal leaf
    ///
    /// Leaves that already have feedback are skipped.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] when the feedback stage is not an
    /// on-demand stage of the graph, or a persistence failure.
    pub async fn collect_feedback(&self, request_id: RequestId) -> Result<RunForest, PipelineError> {
        let stage = self.executor.config().feedback_stage.clone();
        let graph = self.executor.graph();
        if !graph.is_on_demand(&stage) {
            return Err(PipelineError::configuration(format!(
                "feedback stage {stage} is not an on-demand stage"
            )));
        }

        let forest = self.get_runs(request_id).await?;
        let targets: Vec<Run> = forest
            .runs()
            .iter()
            .filter(|run| run.is_completed() && graph.is_terminal(run.stage.as_str()))
            .filter(|run| run.flags.deployed_at.is_some())
            .filter(|run| {
                !forest
                    .children(run.id)
                    .iter()
                    .any(|child| child.stage.as_str() == stage && !child.is_failed())
            })
            .cloned()
            .collect();

        if targets.is_empty() {
            tracing::info!(request = %request_id, "no deployed runs awaiting feedback");
            return Ok(forest);
        }
        tracing::info!(request = %request_id, runs = targets.len(), "collecting feedback");
        self.executor.run_on_demand(request_id, &stage, &targets).await
    }
}
