//! End-to-end behaviour of the executor over the pricing graph

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use xpo_core::merge::is_error_marker;
use xpo_core::AgentInvoker;
use xpo_store::{LineageEnd, RunForest, RunStatus};
use xpo_test_utils::*;

fn assert_chain_integrity(forest: &RunForest, seed: &Value) {
    for run in forest.runs() {
        match run.parent {
            Some(parent) => {
                let parent = forest.get(parent).expect("parent in forest");
                assert_eq!(run.input, parent.output, "run {} input differs from parent output", run.id);
            }
            None => assert_eq!(&run.input, seed),
        }
    }
}

fn stage_count(forest: &RunForest, stage: &str) -> usize {
    forest.runs().iter().filter(|r| r.stage.as_str() == stage).count()
}

#[tokio::test]
async fn linear_request_runs_every_stage_once() {
    let (_, stores) = memory_stores();
    let agents = pricing_agents();
    let executor = executor(pricing_graph(), &agents, stores.clone());
    let request = seeded_request(stores.requests.as_ref()).await;

    let forest = executor.start(request.id).await.unwrap();

    let stages: Vec<&str> = forest.runs().iter().map(|r| r.stage.as_str()).collect();
    assert_eq!(
        stages,
        vec![SEGMENTS, POSITIONING, GAPS, PLAN, SIMULATIONS, SCENARIOS, CASHFLOW]
    );
    assert!(forest.runs().iter().all(|r| r.status == RunStatus::Completed));
    assert_chain_integrity(&forest, &request.seed);

    let request = stores.requests.get(request.id).await.unwrap();
    assert_eq!(request.phase, "completed");
    let leaf = stores.lineage.latest_leaves(request.id).await.unwrap();
    assert_eq!(leaf.len(), 1);
    assert!(leaf[0].flags.approved);
}

#[tokio::test]
async fn resume_after_completion_adds_nothing() {
    let (store, stores) = memory_stores();
    let agents = pricing_agents();
    let executor = executor(pricing_graph(), &agents, stores.clone());
    let request = seeded_request(stores.requests.as_ref()).await;

    executor.start(request.id).await.unwrap();
    let before = store.run_count();

    executor.resume(request.id).await.unwrap();
    executor.resume(request.id).await.unwrap();
    // start on a started request resumes too
    executor.start(request.id).await.unwrap();

    assert_eq!(store.run_count(), before);
    assert!(agents.iter().all(|a| a.name() == "feedback" || a.calls() == 1));
}

#[tokio::test]
async fn fan_out_creates_one_sibling_per_outcome() {
    let (_, stores) = memory_stores();
    let agents = with_overrides(
        pricing_agents(),
        vec![Arc::new(ScriptedAgent::fan_out("roi_gap", vec![json!("g1"), json!("g2"), json!("g3")]))],
    );
    let executor = executor(pricing_graph(), &agents, stores.clone());
    let request = seeded_request(stores.requests.as_ref()).await;

    let forest = executor.start(request.id).await.unwrap();

    let positioning = forest.runs().iter().find(|r| r.stage.as_str() == POSITIONING).unwrap();
    let gaps = forest.children(positioning.id);
    assert_eq!(gaps.len(), 3);
    assert!(gaps.iter().all(|r| r.stage.as_str() == GAPS && r.parent == Some(positioning.id)));
    let mut indexes: Vec<u32> = gaps.iter().map(|r| r.branch_index).collect();
    indexes.sort_unstable();
    assert_eq!(indexes, vec![0, 1, 2]);

    assert_eq!(forest.lineages().len(), 3);
    assert_eq!(stage_count(&forest, CASHFLOW), 3);
    assert_eq!(forest.len(), 2 + 3 * 5);
    assert_chain_integrity(&forest, &request.seed);

    let summary = forest.summary(executor.graph());
    assert_eq!(summary.finished, 3);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn parallel_merge_waits_for_every_agent() {
    let (_, stores) = memory_stores();
    let agents = with_overrides(
        pricing_agents(),
        vec![Arc::new(
            ScriptedAgent::annotating("positioning", json!("value-leader")).with_delay(Duration::from_millis(250)),
        )],
    );
    let executor = executor(pricing_graph(), &agents, stores.clone());
    let request = seeded_request(stores.requests.as_ref()).await;

    let running = {
        let executor = executor.clone();
        let id = request.id;
        tokio::spawn(async move { executor.start(id).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    let partial = stores.lineage.runs_for(request.id).await.unwrap();
    assert!(
        partial.iter().all(|r| r.stage.as_str() != POSITIONING),
        "merged run appended before the slow agent settled"
    );

    let forest = running.await.unwrap().unwrap();
    let merged = forest.runs().iter().find(|r| r.stage.as_str() == POSITIONING).unwrap();
    assert_eq!(merged.output["positioning"], json!("value-leader"));
    assert_eq!(merged.output["competitor"], json!(["acme"]));
    assert_eq!(merged.output["segment_selector"], json!("smb"));
}

#[tokio::test]
async fn timed_out_branch_halts_only_its_lineage() {
    let (_, stores) = memory_stores();
    let planner = ScriptedAgent::annotating("planner", json!("plan")).with_delay_when(|input| {
        if input["roi_gap"] == json!("g2") {
            Duration::from_secs(5)
        } else {
            Duration::ZERO
        }
    });
    let agents = with_overrides(
        pricing_agents(),
        vec![
            Arc::new(ScriptedAgent::fan_out("roi_gap", vec![json!("g1"), json!("g2"), json!("g3")])),
            Arc::new(planner),
        ],
    );
    let executor = executor(pricing_graph(), &agents, stores.clone());
    let request = seeded_request(stores.requests.as_ref()).await;

    let forest = executor.start(request.id).await.unwrap();

    let failed: Vec<_> = forest.runs().iter().filter(|r| r.is_failed()).collect();
    assert_eq!(failed.len(), 1);
    let failed = failed[0];
    assert_eq!(failed.stage.as_str(), PLAN);
    assert_eq!(failed.input["roi_gap"], json!("g2"));
    assert_eq!(failed.output["error"]["kind"], json!("fatal"));
    assert!(failed.output["error"]["message"].as_str().unwrap().contains("timed out"));

    let finished: Vec<_> = forest
        .live_leaves()
        .into_iter()
        .filter(|r| r.stage.as_str() == CASHFLOW)
        .map(|r| r.input["roi_gap"].clone())
        .collect();
    assert_eq!(finished.len(), 2);
    assert!(finished.contains(&json!("g1")) && finished.contains(&json!("g3")));

    assert_eq!(forest.len(), 2 + 3 + 1 + 2 * 4);
    assert_chain_integrity(&forest, &request.seed);

    let request = stores.requests.get(request.id).await.unwrap();
    assert_eq!(request.phase, "experimental_plan_generated_failed");
    assert!(request.is_failed());
}

#[tokio::test]
async fn fatal_error_in_one_sibling_leaves_others_untouched() {
    let (_, stores) = memory_stores();
    let simulator = ScriptedAgent::from_fn("simulator", |input, _| {
        if input["roi_gap"] == json!("g1") {
            Err(xpo_core::AgentError::fatal("simulation service rejected credentials"))
        } else {
            Ok(xpo_core::AgentOutcome::Branches(vec![
                annotate(input, "simulator", json!("s1")),
                annotate(input, "simulator", json!("s2")),
            ]))
        }
    });
    let agents = with_overrides(
        pricing_agents(),
        vec![
            Arc::new(ScriptedAgent::fan_out("roi_gap", vec![json!("g1"), json!("g2")])),
            Arc::new(simulator),
        ],
    );
    let executor = executor(pricing_graph(), &agents, stores.clone());
    let request = seeded_request(stores.requests.as_ref()).await;

    let forest = executor.start(request.id).await.unwrap();

    let g2_leaves: Vec<_> = forest
        .live_leaves()
        .into_iter()
        .filter(|r| r.input["roi_gap"] == json!("g2"))
        .collect();
    assert_eq!(g2_leaves.len(), 2);
    assert!(g2_leaves.iter().all(|r| r.stage.as_str() == CASHFLOW && r.is_completed()));

    let open = forest.open_failures();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].stage.as_str(), SIMULATIONS);
    assert_eq!(open[0].input["roi_gap"], json!("g1"));
}

#[tokio::test]
async fn soft_errors_stay_visible_in_outputs() {
    let (_, stores) = memory_stores();
    let agents = with_overrides(
        pricing_agents(),
        vec![
            Arc::new(ScriptedAgent::soft("competitor", "could not parse model output")),
            Arc::new(ScriptedAgent::soft("planner", "plan truncated")),
        ],
    );
    let executor = executor(pricing_graph(), &agents, stores.clone());
    let request = seeded_request(stores.requests.as_ref()).await;

    let forest = executor.start(request.id).await.unwrap();
    assert!(forest.runs().iter().all(|r| r.is_completed()));

    let positioning = forest.runs().iter().find(|r| r.stage.as_str() == POSITIONING).unwrap();
    assert!(is_error_marker(&positioning.output["competitor"]));
    assert_eq!(positioning.output["positioning"], json!("value-leader"));

    let plan = forest.runs().iter().find(|r| r.stage.as_str() == PLAN).unwrap();
    assert_eq!(plan.output["planner"]["error"]["kind"], json!("soft"));
    assert_eq!(plan.output["planner"]["error"]["stage"], json!(PLAN));

    // the markers ride along to the terminal run
    let leaf = forest.leaves()[0];
    assert!(is_error_marker(&leaf.output["competitor"]));
    assert!(is_error_marker(&leaf.output["planner"]));
    assert_eq!(stores.requests.get(request.id).await.unwrap().phase, "completed");
}

#[tokio::test]
async fn empty_fan_out_ends_the_lineage() {
    let (store, stores) = memory_stores();
    let agents = with_overrides(pricing_agents(), vec![Arc::new(ScriptedAgent::fan_out("roi_gap", vec![]))]);
    let executor = executor(pricing_graph(), &agents, stores.clone());
    let request = seeded_request(stores.requests.as_ref()).await;

    let forest = executor.start(request.id).await.unwrap();

    assert_eq!(forest.len(), 3);
    let end = forest.leaves()[0];
    assert_eq!(end.stage.as_str(), GAPS);
    assert_eq!(end.lineage_end, Some(LineageEnd::NoBranches));
    assert_eq!(end.output, end.input);
    assert_eq!(stores.requests.get(request.id).await.unwrap().phase, "completed");

    executor.resume(request.id).await.unwrap();
    assert_eq!(store.run_count(), 3);
}
