//! Storage contracts
//!
//! Three seams, implemented together by each backend:
//! - [`LineageStore`]: the authoritative, append-only run forest
//! - [`RequestStore`]: mutable request records with their coarse phase
//! - [`AuditSink`]: flat observability log, never read for control decisions

use crate::audit::StepAudit;
use crate::error::StoreError;
use crate::ids::{InvocationId, RequestId, RunId};
use crate::request::{NewRequest, Request};
use crate::run::{FlagUpdate, Run, RunDraft, StepKey};
use async_trait::async_trait;
use std::sync::Arc;

/// Append-only forest of runs
#[async_trait]
pub trait LineageStore: Send + Sync {
    /// Atomically append one step's runs under `key`
    ///
    /// Attempts are numbered per slot. The batch is rejected with
    /// [`StoreError::Conflict`] when the slot already holds a run that did
    /// not fail, so a step is recorded at most once.
    async fn append_children(&self, key: &StepKey, drafts: Vec<RunDraft>) -> Result<Vec<Run>, StoreError>;

    /// Runs already recorded for `key`, every attempt included
    async fn slot(&self, key: &StepKey) -> Result<Vec<Run>, StoreError>;

    /// Fetch one run
    async fn get_run(&self, id: RunId) -> Result<Run, StoreError>;

    /// Every run of a request, oldest first
    async fn runs_for(&self, request_id: RequestId) -> Result<Vec<Run>, StoreError>;

    /// Runs with no recorded child, across all lineages
    async fn latest_leaves(&self, request_id: RequestId) -> Result<Vec<Run>, StoreError>;

    /// Root-to-leaf path ending at `id`
    async fn chain(&self, id: RunId) -> Result<Vec<Run>, StoreError>;

    /// Write a terminal flag on the latest run of a lineage
    ///
    /// Rejected with [`StoreError::InvalidUpdate`] when the run already has a
    /// child, when the flag is already set, or when deploying an unapproved
    /// run.
    async fn set_terminal_flags(&self, id: RunId, update: FlagUpdate) -> Result<Run, StoreError>;
}

/// Mutable request records
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Create a request, assigning the next sequence number for its subject
    async fn create(&self, new: NewRequest, phase: &str) -> Result<Request, StoreError>;

    /// Fetch a request
    async fn get(&self, id: RequestId) -> Result<Request, StoreError>;

    /// Overwrite the phase cursor
    async fn set_phase(&self, id: RequestId, phase: &str) -> Result<(), StoreError>;

    /// All requests, highest sequence first
    async fn list(&self) -> Result<Vec<Request>, StoreError>;
}

/// Observability log of stage steps
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append an entry
    async fn record(&self, entry: StepAudit) -> Result<(), StoreError>;

    /// Entries of one invocation, by step order
    async fn by_invocation(&self, invocation: InvocationId) -> Result<Vec<StepAudit>, StoreError>;

    /// Entries of one invocation at one step order
    async fn step(&self, invocation: InvocationId, step_order: u32) -> Result<Vec<StepAudit>, StoreError>;
}

/// The three stores an executor works against
#[derive(Clone)]
pub struct Stores {
    /// Run forest
    pub lineage: Arc<dyn LineageStore>,
    /// Requests
    pub requests: Arc<dyn RequestStore>,
    /// Step audit
    pub audit: Arc<dyn AuditSink>,
}

impl Stores {
    /// Use one backend for all three seams
    #[must_use]
    pub fn shared<S>(backend: Arc<S>) -> Self
    where
        S: LineageStore + RequestStore + AuditSink + 'static,
    {
        Self {
            lineage: backend.clone(),
            requests: backend.clone(),
            audit: backend,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
