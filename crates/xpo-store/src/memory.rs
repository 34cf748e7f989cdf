//! In-memory backend
//!
//! Holds every record behind one `parking_lot` lock, so each trait call is
//! atomic. Used by tests and by the CLI when no database path is given.

use crate::audit::StepAudit;
use crate::error::StoreError;
use crate::ids::{InvocationId, RequestId, RunId};
use crate::request::{NewRequest, Request};
use crate::run::{FlagUpdate, Run, RunDraft, StepKey};
use crate::store::{AuditSink, LineageStore, RequestStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct State {
    requests: HashMap<RequestId, Request>,
    runs: Vec<Run>,
    run_index: HashMap<RunId, usize>,
    audit: Vec<StepAudit>,
}

impl State {
    fn run(&self, id: RunId) -> Result<&Run, StoreError> {
        self.run_index
            .get(&id)
            .map(|&i| &self.runs[i])
            .ok_or_else(|| StoreError::run_not_found(id))
    }

    fn has_children(&self, id: RunId) -> bool {
        self.runs.iter().any(|r| r.parent == Some(id))
    }

    fn slot<'a>(&'a self, key: &'a StepKey) -> impl Iterator<Item = &'a Run> + 'a {
        self.runs
            .iter()
            .filter(move |r| r.request_id == key.request_id && r.parent == key.parent && r.stage == key.stage)
    }
}

/// Memory-backed implementation of all three store traits
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with [`StoreError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    /// Total runs across all requests
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.state.read().runs.len()
    }
}

#[async_trait]
impl LineageStore for MemoryStore {
    async fn append_children(&self, key: &StepKey, drafts: Vec<RunDraft>) -> Result<Vec<Run>, StoreError> {
        self.check_available()?;
        let mut state = self.state.write();

        if !state.requests.contains_key(&key.request_id) {
            return Err(StoreError::request_not_found(key.request_id));
        }
        if let Some(parent) = key.parent {
            let parent = state.run(parent)?;
            if parent.request_id != key.request_id {
                return Err(StoreError::invalid_update(parent.id, "parent belongs to another request"));
            }
        }
        if state.slot(key).any(|r| !r.is_failed()) {
            return Err(StoreError::Conflict {
                parent: key.parent_key(),
                stage: key.stage.to_string(),
            });
        }

        let attempt = state.slot(key).map(|r| r.attempt).max().unwrap_or(0) + 1;
        let created: Vec<Run> = drafts
            .into_iter()
            .map(|draft| Run::from_draft(key, draft, attempt))
            .collect();

        for run in &created {
            let at = state.runs.len();
            state.run_index.insert(run.id, at);
            state.runs.push(run.clone());
        }
        tracing::debug!(slot = %key, attempt, runs = created.len(), "appended runs");
        Ok(created)
    }

    async fn slot(&self, key: &StepKey) -> Result<Vec<Run>, StoreError> {
        Ok(self.state.read().slot(key).cloned().collect())
    }

    async fn get_run(&self, id: RunId) -> Result<Run, StoreError> {
        self.state.read().run(id).cloned()
    }

    async fn runs_for(&self, request_id: RequestId) -> Result<Vec<Run>, StoreError> {
        Ok(self
            .state
            .read()
            .runs
            .iter()
            .filter(|r| r.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn latest_leaves(&self, request_id: RequestId) -> Result<Vec<Run>, StoreError> {
        let state = self.state.read();
        Ok(state
            .runs
            .iter()
            .filter(|r| r.request_id == request_id && !state.has_children(r.id))
            .cloned()
            .collect())
    }

    async fn chain(&self, id: RunId) -> Result<Vec<Run>, StoreError> {
        let state = self.state.read();
        let mut path = vec![state.run(id)?.clone()];
        while let Some(parent) = path.last().and_then(|r| r.parent) {
            path.push(state.run(parent)?.clone());
        }
        path.reverse();
        Ok(path)
    }

    async fn set_terminal_flags(&self, id: RunId, update: FlagUpdate) -> Result<Run, StoreError> {
        self.check_available()?;
        let mut state = self.state.write();
        let run = state.run(id)?;
        check_flag_update(run, update, state.has_children(id))?;

        let at = state.run_index[&id];
        let run = &mut state.runs[at];
        match update {
            FlagUpdate::Approve => run.flags.approved = true,
            FlagUpdate::Deploy(when) => run.flags.deployed_at = Some(when),
        }
        Ok(run.clone())
    }
}

/// Guard shared by the backends for terminal flag writes
///
/// # Errors
///
/// [`StoreError::InvalidUpdate`] when the run is not a completed leaf or the
/// flag cannot be written in its current state.
pub fn check_flag_update(run: &Run, update: FlagUpdate, has_children: bool) -> Result<(), StoreError> {
    if has_children {
        return Err(StoreError::invalid_update(run.id, "run is no longer the latest of its lineage"));
    }
    if !run.is_completed() {
        return Err(StoreError::invalid_update(run.id, "run did not complete"));
    }
    match update {
        FlagUpdate::Approve if run.flags.approved => {
            Err(StoreError::invalid_update(run.id, "approval already granted"))
        }
        FlagUpdate::Deploy(_) if !run.flags.approved => {
            Err(StoreError::invalid_update(run.id, "run is not approved"))
        }
        FlagUpdate::Deploy(_) if run.flags.deployed_at.is_some() => {
            Err(StoreError::invalid_update(run.id, "run already deployed"))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn create(&self, new: NewRequest, phase: &str) -> Result<Request, StoreError> {
        self.check_available()?;
        let mut state = self.state.write();
        let sequence = state
            .requests
            .values()
            .filter(|r| r.subject_id == new.subject_id)
            .map(|r| r.sequence)
            .max()
            .unwrap_or(0)
            + 1;
        let request = Request::from_new(new, sequence, phase);
        state.requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get(&self, id: RequestId) -> Result<Request, StoreError> {
        self.state
            .read()
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::request_not_found(id))
    }

    async fn set_phase(&self, id: RequestId, phase: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.write();
        let request = state
            .requests
            .get_mut(&id)
            .ok_or_else(|| StoreError::request_not_found(id))?;
        if request.phase != phase {
            request.phase = phase.to_string();
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Request>, StoreError> {
        let mut all: Vec<Request> = self.state.read().requests.values().cloned().collect();
        all.sort_by(|a, b| {
            b.sequence
                .cmp(&a.sequence)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(all)
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn record(&self, entry: StepAudit) -> Result<(), StoreError> {
        self.check_available()?;
        self.state.write().audit.push(entry);
        Ok(())
    }

    async fn by_invocation(&self, invocation: InvocationId) -> Result<Vec<StepAudit>, StoreError> {
        let mut entries: Vec<StepAudit> = self
            .state
            .read()
            .audit
            .iter()
            .filter(|e| e.invocation_id == invocation)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.step_order);
        Ok(entries)
    }

    async fn step(&self, invocation: InvocationId, step_order: u32) -> Result<Vec<StepAudit>, StoreError> {
        Ok(self
            .state
            .read()
            .audit
            .iter()
            .filter(|e| e.invocation_id == invocation && e.step_order == step_order)
            .cloned()
            .collect())
    }
}
