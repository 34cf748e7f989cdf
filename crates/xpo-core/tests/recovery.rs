//! Persistence outages, retries and concurrent resumption

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use xpo_core::{AgentInvoker, AgentOutcome, PipelineError};
use xpo_store::{input_digest, RunDraft, StepKey, StoreError};
use xpo_test_utils::*;

#[tokio::test]
async fn store_outage_aborts_without_partial_runs() {
    let (store, stores) = memory_stores();
    let outage = store.clone();
    let planner = ScriptedAgent::from_fn("planner", move |input, call| {
        if call == 0 {
            outage.set_unavailable(true);
        }
        Ok(AgentOutcome::Single(annotate(input, "planner", json!("plan"))))
    });
    let planner = Arc::new(planner);
    let agents = with_overrides(pricing_agents(), vec![planner.clone()]);
    let executor = executor(pricing_graph(), &agents, stores.clone());
    let request = seeded_request(stores.requests.as_ref()).await;

    let err = executor.start(request.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Persistence(StoreError::Unavailable(_))));
    assert!(err.is_retryable());

    let recorded = stores.lineage.runs_for(request.id).await.unwrap();
    let stages: Vec<&str> = recorded.iter().map(|r| r.stage.as_str()).collect();
    assert_eq!(stages, vec![SEGMENTS, POSITIONING, GAPS]);

    store.set_unavailable(false);
    let forest = executor.resume(request.id).await.unwrap();

    assert_eq!(forest.len(), 7);
    assert_eq!(planner.calls(), 2);
    assert_eq!(stores.requests.get(request.id).await.unwrap().phase, "completed");
}

#[tokio::test]
async fn resume_leaves_failures_alone_and_retry_replaces_them() {
    let (store, stores) = memory_stores();
    let planner = Arc::new(ScriptedAgent::flaky("planner", 1, json!("plan")));
    let agents = with_overrides(pricing_agents(), vec![planner.clone()]);
    let executor = executor(pricing_graph(), &agents, stores.clone());
    let request = seeded_request(stores.requests.as_ref()).await;

    executor.start(request.id).await.unwrap();
    assert_eq!(store.run_count(), 4);
    assert_eq!(
        stores.requests.get(request.id).await.unwrap().phase,
        "experimental_plan_generated_failed"
    );

    executor.resume(request.id).await.unwrap();
    assert_eq!(store.run_count(), 4);
    assert_eq!(planner.calls(), 1);

    let forest = executor.retry_failed(request.id).await.unwrap();
    assert_eq!(forest.len(), 8);
    assert!(forest.open_failures().is_empty());

    let plans: Vec<_> = forest.runs().iter().filter(|r| r.stage.as_str() == PLAN).collect();
    assert_eq!(plans.len(), 2);
    assert!(plans[0].is_failed() && plans[0].attempt == 1);
    assert!(plans[1].is_completed() && plans[1].attempt == 2);
    assert_eq!(plans[0].parent, plans[1].parent);
    assert_eq!(plans[0].input, plans[1].input);

    assert_eq!(stores.requests.get(request.id).await.unwrap().phase, "completed");

    // nothing left to retry
    executor.retry_failed(request.id).await.unwrap();
    assert_eq!(store.run_count(), 8);
}

#[tokio::test]
async fn concurrent_resumes_record_each_step_once() {
    let (store, stores) = memory_stores();
    let outage = store.clone();
    let planner = Arc::new(ScriptedAgent::from_fn("planner", move |input, call| {
        if call == 0 {
            outage.set_unavailable(true);
        }
        Ok(AgentOutcome::Single(annotate(input, "planner", json!("plan"))))
    }));
    let agents = with_overrides(
        pricing_agents(),
        vec![
            planner.clone(),
            Arc::new(ScriptedAgent::fan_out("simulator", vec![json!("s1"), json!("s2"), json!("s3")])),
        ],
    );
    let executor = executor(pricing_graph(), &agents, stores.clone());
    let request = seeded_request(stores.requests.as_ref()).await;

    assert!(executor.start(request.id).await.is_err());
    store.set_unavailable(false);

    let (a, b) = tokio::join!(executor.resume(request.id), executor.resume(request.id));
    a.unwrap();
    b.unwrap();

    let forest = executor.resume(request.id).await.unwrap();
    assert_eq!(planner.calls(), 2);
    assert_eq!(forest.len(), 3 + 1 + 1 + 3 * 2);
    for run in forest.runs() {
        let siblings = forest
            .runs()
            .iter()
            .filter(|r| r.parent == run.parent && r.stage == run.stage && r.branch_index == run.branch_index)
            .count();
        assert_eq!(siblings, 1, "duplicate run for slot of {}", run.id);
    }
    assert_eq!(stores.requests.get(request.id).await.unwrap().phase, "completed");
}

#[tokio::test]
async fn unknown_request_is_reported() {
    let (_, stores) = memory_stores();
    let executor = executor(pricing_graph(), &pricing_agents(), stores);
    let missing = xpo_store::RequestId::new();

    assert!(matches!(
        executor.start(missing).await,
        Err(PipelineError::RequestNotFound(_))
    ));
    assert!(matches!(
        executor.retry_failed(missing).await,
        Err(PipelineError::RequestNotFound(_))
    ));
}

#[tokio::test]
async fn unregistered_agent_is_a_configuration_error() {
    let (_, stores) = memory_stores();
    let partial: Vec<_> = pricing_agents().into_iter().skip(1).collect();
    let err = xpo_core::PipelineExecutor::new(Arc::new(pricing_graph()), registry(&partial), stores, test_config())
        .unwrap_err();

    assert!(matches!(&err, PipelineError::Configuration(msg) if msg.contains("segment_selector")));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn creation_phase_outside_the_graph_is_rejected() {
    let (_, stores) = memory_stores();
    let build = |phase: &str| {
        xpo_core::PipelineExecutor::new(
            Arc::new(pricing_graph()),
            registry(&pricing_agents()),
            stores.clone(),
            test_config().with_default_phase(phase),
        )
    };

    let err = build("queued").unwrap_err();
    assert!(matches!(&err, PipelineError::Configuration(msg) if msg.contains("queued")));
    assert!(build("segments_failed").is_err());

    assert!(build(POSITIONING).is_ok());
    assert!(build("completed").is_ok());
    assert!(build("experimental_plan_generated_failed").is_ok());
}

#[tokio::test]
async fn recorded_slot_with_other_input_is_reused() {
    let (store, stores) = memory_stores();
    let agents = pricing_agents();
    let executor = executor(pricing_graph(), &agents, stores.clone());
    let request = seeded_request(stores.requests.as_ref()).await;

    let forest = executor.start(request.id).await.unwrap();
    let terminal = forest.live_leaves()[0].clone();
    assert_eq!(terminal.stage.as_str(), CASHFLOW);

    let stale_input = json!({"collected_by": "an earlier deployment"});
    let key = StepKey::new(request.id, Some(terminal.id), FEEDBACK.into());
    let existing = stores
        .lineage
        .append_children(&key, vec![RunDraft::completed(stale_input.clone(), json!({"feedback": "flat"}))])
        .await
        .unwrap()
        .remove(0);
    assert_ne!(input_digest(&stale_input), input_digest(&terminal.output));
    let before = store.run_count();

    let after = executor.run_on_demand(request.id, FEEDBACK, &[terminal.clone()]).await.unwrap();
    executor.resume(request.id).await.unwrap();

    assert_eq!(store.run_count(), before);
    let feedback = agents.iter().find(|a| a.name() == "feedback").unwrap();
    assert_eq!(feedback.calls(), 0);
    let children = after.children(terminal.id);
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, existing.id);
    assert_eq!(children[0].input, stale_input);
}
