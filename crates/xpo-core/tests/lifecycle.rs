//! Request lifecycle through the service: approval, deployment, feedback and audit

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use xpo_core::{AgentInvoker, AgentOutcome, ExperimentService, PipelineError};
use xpo_store::{AuditSink, InvocationId, StepAudit, StoreError, Stores};
use xpo_store_sqlite::SqliteStore;
use xpo_test_utils::*;

#[derive(Default)]
struct RecordingAudit {
    entries: Mutex<Vec<StepAudit>>,
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn record(&self, entry: StepAudit) -> Result<(), StoreError> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }

    async fn by_invocation(&self, invocation: InvocationId) -> Result<Vec<StepAudit>, StoreError> {
        let mut found: Vec<_> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.invocation_id == invocation)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.step_order);
        Ok(found)
    }

    async fn step(&self, invocation: InvocationId, step_order: u32) -> Result<Vec<StepAudit>, StoreError> {
        let all = self.by_invocation(invocation).await?;
        Ok(all.into_iter().filter(|e| e.step_order == step_order).collect())
    }
}

struct BrokenAudit;

#[async_trait]
impl AuditSink for BrokenAudit {
    async fn record(&self, _: StepAudit) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("audit sink offline".into()))
    }

    async fn by_invocation(&self, _: InvocationId) -> Result<Vec<StepAudit>, StoreError> {
        Ok(Vec::new())
    }

    async fn step(&self, _: InvocationId, _: u32) -> Result<Vec<StepAudit>, StoreError> {
        Ok(Vec::new())
    }
}

fn service(agents: &[Arc<ScriptedAgent>]) -> (ExperimentService, Stores) {
    let (_, stores) = memory_stores();
    (ExperimentService::new(executor(pricing_graph(), agents, stores.clone())), stores)
}

#[tokio::test]
async fn created_requests_run_in_the_background() {
    let (service, _) = service(&pricing_agents());

    let first = service.create_request("product-7", "lift margin", "pricing").await.unwrap();
    let second = service.create_request("product-7", "cut churn", "retention").await.unwrap();

    let forest = service.wait(first).await.unwrap();
    assert_eq!(forest.len(), 7);
    service.wait(second).await.unwrap();

    let first = service.get_request(first).await.unwrap();
    let second = service.get_request(second).await.unwrap();
    assert_eq!((first.sequence, second.sequence), (1, 2));
    assert_eq!(first.phase, "completed");
    assert_eq!(first.seed["objective"], json!("lift margin"));

    // nothing running any more: wait returns the stored forest
    assert_eq!(service.wait(first.id).await.unwrap().len(), 7);
}

#[tokio::test]
async fn finished_background_pipelines_release_their_handles() {
    let (service, stores) = service(&pricing_agents());

    let mut ids = Vec::new();
    for n in 0..5 {
        let subject = format!("product-{n}");
        ids.push(service.create_request(&subject, "lift margin", "pricing").await.unwrap());
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while service.running() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("background pipelines settle");

    for id in ids {
        assert_eq!(stores.requests.get(id).await.unwrap().phase, "completed");
        assert_eq!(service.wait(id).await.unwrap().len(), 7);
    }
    assert_eq!(service.running(), 0);
}

#[tokio::test]
async fn approved_runs_deploy_once_then_collect_feedback() {
    let agents = pricing_agents();
    let (service, _) = service(&agents);
    let id = service.create_request("product-7", "lift margin", "pricing").await.unwrap();
    let forest = service.wait(id).await.unwrap();

    let ready = service.completed_and_approved(None).await.unwrap();
    assert_eq!(ready.iter().map(|r| r.id).collect::<Vec<_>>(), vec![id]);
    assert_eq!(service.completed_and_approved(Some(id)).await.unwrap().len(), 1);

    let terminal = service.deployable(&forest)[0].clone();
    assert_eq!(terminal.stage.as_str(), CASHFLOW);

    let segments = forest.roots().next().unwrap().id;
    assert!(matches!(
        service.mark_deployed(id, segments).await,
        Err(PipelineError::Deployment(_))
    ));

    let other = service.create_request("product-8", "x", "y").await.unwrap();
    service.wait(other).await.unwrap();
    assert!(matches!(
        service.mark_deployed(other, terminal.id).await,
        Err(PipelineError::Deployment(_))
    ));

    let deployed = service.mark_deployed(id, terminal.id).await.unwrap();
    assert!(deployed.flags.deployed_at.is_some());
    assert!(service.completed_and_approved(Some(id)).await.unwrap().is_empty());
    assert!(matches!(
        service.mark_deployed(id, terminal.id).await,
        Err(PipelineError::Deployment(_))
    ));

    let forest = service.collect_feedback(id).await.unwrap();
    let feedback = forest.children(terminal.id);
    assert_eq!(feedback.len(), 1);
    assert_eq!(feedback[0].stage.as_str(), FEEDBACK);
    assert_eq!(feedback[0].input, terminal.output);
    assert_eq!(feedback[0].output["feedback"], json!("conversion up"));
    assert_eq!(service.get_request(id).await.unwrap().phase, FEEDBACK);

    let again = service.collect_feedback(id).await.unwrap();
    assert_eq!(again.len(), forest.len());
    let feedback_agent = agents.iter().find(|a| a.name() == "feedback").unwrap();
    assert_eq!(feedback_agent.calls(), 1);

    // undeployed requests have nothing to collect
    let untouched = service.collect_feedback(other).await.unwrap();
    assert!(untouched.runs().iter().all(|r| r.stage.as_str() != FEEDBACK));
}

#[tokio::test]
async fn withheld_approval_blocks_deployment() {
    let agents = with_overrides(
        pricing_agents(),
        vec![Arc::new(ScriptedAgent::from_fn("cashflow", |input, _| {
            Ok(AgentOutcome::Single(annotate(input, APPROVAL_FIELD, json!(false))))
        }))],
    );
    let (service, _) = service(&agents);
    let id = service.create_request("product-7", "lift margin", "pricing").await.unwrap();
    let forest = service.wait(id).await.unwrap();

    let terminal = forest.leaves()[0];
    assert!(!terminal.flags.approved);
    assert!(service.completed_and_approved(None).await.unwrap().is_empty());
    assert!(matches!(
        service.mark_deployed(id, terminal.id).await,
        Err(PipelineError::Deployment(_))
    ));
}

#[tokio::test]
async fn feedback_stage_must_be_on_demand() {
    let (_, stores) = memory_stores();
    let config = test_config().with_feedback_stage(PLAN);
    let service = ExperimentService::new(executor_with(pricing_graph(), &pricing_agents(), stores, config));
    let id = service.create_request("product-7", "lift margin", "pricing").await.unwrap();
    service.wait(id).await.unwrap();

    assert!(matches!(
        service.collect_feedback(id).await,
        Err(PipelineError::Configuration(_))
    ));
    assert!(matches!(
        service.get_runs(xpo_store::RequestId::new()).await,
        Err(PipelineError::RequestNotFound(_))
    ));
}

#[tokio::test]
async fn audit_log_records_each_step_with_conflicts() {
    let (store, _) = memory_stores();
    let audit = Arc::new(RecordingAudit::default());
    let stores = Stores {
        lineage: store.clone(),
        requests: store.clone(),
        audit: audit.clone(),
    };
    let agents = with_overrides(
        pricing_agents(),
        vec![
            Arc::new(ScriptedAgent::from_fn("positioning", |input, _| {
                Ok(AgentOutcome::Single(annotate(input, "segment_note", json!("premium"))))
            })),
            Arc::new(ScriptedAgent::from_fn("competitor", |input, _| {
                Ok(AgentOutcome::Single(annotate(input, "segment_note", json!("budget"))))
            })),
        ],
    );
    let executor = executor(pricing_graph(), &agents, stores.clone());
    let request = seeded_request(stores.requests.as_ref()).await;
    let forest = executor.start(request.id).await.unwrap();

    let positioning = forest.runs().iter().find(|r| r.stage.as_str() == POSITIONING).unwrap();
    assert_eq!(positioning.output["segment_note"], json!("budget"));

    let invocation = audit.entries.lock().unwrap()[0].invocation_id;
    let entries = audit.by_invocation(invocation).await.unwrap();
    assert_eq!(entries.iter().map(|e| e.step_order).collect::<Vec<_>>(), (1..=7).collect::<Vec<_>>());
    assert!(entries.iter().all(|e| e.subject_id == "product-42"));

    let merged = audit.step(invocation, 2).await.unwrap();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].step_name, POSITIONING);
    assert_eq!(merged[0].merge_conflicts, vec!["segment_note: positioning overwritten by competitor".to_string()]);
    assert_eq!(merged[0].step_output, positioning.output);
}

#[tokio::test]
async fn audit_failures_do_not_stop_the_pipeline() {
    let (store, _) = memory_stores();
    let stores = Stores {
        lineage: store.clone(),
        requests: store.clone(),
        audit: Arc::new(BrokenAudit),
    };
    let executor = executor(pricing_graph(), &pricing_agents(), stores.clone());
    let request = seeded_request(stores.requests.as_ref()).await;

    let forest = executor.start(request.id).await.unwrap();
    assert_eq!(forest.len(), 7);
}

#[tokio::test]
async fn sqlite_history_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xpo.db");
    let three_gaps = || {
        with_overrides(
            pricing_agents(),
            vec![Arc::new(ScriptedAgent::fan_out("roi_gap", vec![json!("g1"), json!("g2"), json!("g3")]))],
        )
    };

    let id = {
        let stores = Stores::shared(Arc::new(SqliteStore::open(&path).unwrap()));
        let executor = executor(pricing_graph(), &three_gaps(), stores.clone());
        let request = seeded_request(stores.requests.as_ref()).await;
        let forest = executor.start(request.id).await.unwrap();
        assert_eq!(forest.len(), 17);
        request.id
    };

    let stores = Stores::shared(Arc::new(SqliteStore::open(&path).unwrap()));
    let agents = three_gaps();
    let executor = executor(pricing_graph(), &agents, stores.clone());

    let forest = executor.resume(id).await.unwrap();
    assert_eq!(forest.len(), 17);
    assert!(agents.iter().all(|a| a.calls() == 0));
    assert_eq!(forest.lineages().len(), 3);
    assert_eq!(stores.requests.get(id).await.unwrap().phase, "completed");

    let leaf = forest.leaves()[0].id;
    let chain = stores.lineage.chain(leaf).await.unwrap();
    assert_eq!(chain.len(), 7);
    assert_eq!(chain.first().unwrap().stage.as_str(), SEGMENTS);
    assert_eq!(chain.last().unwrap().id, leaf);
}

#[tokio::test]
async fn sqlite_retry_appends_a_new_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let stores = Stores::shared(Arc::new(SqliteStore::open(&dir.path().join("xpo.db")).unwrap()));
    let agents = with_overrides(
        pricing_agents(),
        vec![Arc::new(ScriptedAgent::flaky("planner", 1, json!("plan")))],
    );
    let executor = executor(pricing_graph(), &agents, stores.clone());
    let request = seeded_request(stores.requests.as_ref()).await;

    executor.start(request.id).await.unwrap();
    let forest = executor.retry_failed(request.id).await.unwrap();

    assert_eq!(forest.len(), 8);
    assert!(forest.open_failures().is_empty());
    assert_eq!(stores.requests.get(request.id).await.unwrap().phase, "completed");
}
