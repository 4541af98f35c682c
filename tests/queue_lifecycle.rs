//! End-to-end queue behaviour through the public `QueueOrchestrator` API.
//!
//! Uses the in-memory store and the scripted executor; no network, no
//! subprocesses.

use std::sync::Arc;
use std::time::Duration;

use negotiation_orchestrator::config::QueueConfig;
use negotiation_orchestrator::cost::CostModel;
use negotiation_orchestrator::notifier::EventKind;
use negotiation_orchestrator::simulation::executor::Script;
use negotiation_orchestrator::simulation::model::{
    Counterpart, Dimension, NegotiationOutcome, NegotiationStatus, QueueProgress, QueueStatus,
    RunStatus, Scenario, UserRole,
};
use negotiation_orchestrator::{
    Catalog, MemoryStore, Notifier, QueueOrchestrator, ScriptedExecutor,
};

const CATALOG: &str = r#"
[[techniques]]
id = "reciprocity"
name = "Reciprocity"

[[techniques]]
id = "authority"
name = "Authority"

[[techniques]]
id = "scarcity"
name = "Scarcity"

[[tactics]]
id = "anchoring"
name = "Anchoring"

[[tactics]]
id = "flinch"
name = "Flinch"

[[tactics]]
id = "nibble"
name = "Nibble"
"#;

fn scenario(techniques: &[&str], tactics: &[&str]) -> Scenario {
    Scenario {
        user_role: UserRole::Seller,
        negotiation_type: None,
        dimensions: vec![Dimension {
            name: "Price".to_string(),
            min_value: 10.0,
            max_value: 20.0,
            target_value: 18.0,
            priority: 1,
            unit: None,
        }],
        products: vec![],
        technique_ids: techniques.iter().map(|s| s.to_string()).collect(),
        tactic_ids: tactics.iter().map(|s| s.to_string()).collect(),
        counterpart: Counterpart::default(),
        max_rounds: None,
        context: serde_json::Value::Null,
    }
}

fn orchestrator(
    executor: Arc<ScriptedExecutor>,
    max_concurrency: usize,
) -> Arc<QueueOrchestrator> {
    QueueOrchestrator::new(
        Arc::new(MemoryStore::new()),
        executor,
        Arc::new(Catalog::from_toml(CATALOG).expect("catalog parses")),
        Notifier::new(1024),
        QueueConfig {
            max_concurrency,
            ..QueueConfig::default()
        },
        CostModel::default(),
    )
}

async fn wait_terminal(orch: &QueueOrchestrator, queue_id: &str) -> QueueProgress {
    for _ in 0..400 {
        let p = orch.queue_status(queue_id).await.expect("status");
        if p.status.is_terminal() {
            return p;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue {queue_id} did not finish");
}

async fn wait_until<F: Fn() -> bool>(what: &str, f: F) {
    for _ in 0..400 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_full_matrix_runs_once_each() {
    let executor = Arc::new(ScriptedExecutor::new());
    let orch = orchestrator(Arc::clone(&executor), 4);

    let n = orch
        .create_negotiation(
            "Matrix",
            scenario(&["reciprocity", "authority", "scarcity"], &["anchoring", "flinch", "nibble"]),
        )
        .await
        .expect("created");
    let queue = orch.start_negotiation(&n.id).await.expect("started");
    assert_eq!(queue.total_simulations, 9);

    let progress = wait_terminal(&orch, &queue.id).await;
    assert_eq!(progress.status, QueueStatus::Completed);
    assert_eq!(progress.completed_count, 9);

    let mut executed = executor.executed();
    executed.sort();
    executed.dedup();
    assert_eq!(executed.len(), 9, "every run executes exactly once");
    assert!(executor.max_in_flight() <= 4);

    let results = orch.queue_results(&queue.id).await.expect("results");
    let pairs: Vec<(String, String)> = results
        .iter()
        .map(|r| (r.run.technique_id.clone(), r.run.tactic_id.clone()))
        .collect();
    assert_eq!(pairs[0], ("reciprocity".to_string(), "anchoring".to_string()));
    assert_eq!(pairs[3], ("authority".to_string(), "anchoring".to_string()));
    assert_eq!(pairs[8], ("scarcity".to_string(), "nibble".to_string()));

    // Seller at target: the achieved-target check is inclusive.
    assert!(results[0].run.dimension_results[0].achieved_target);
    assert_eq!(
        orch.get_negotiation(&n.id).await.expect("negotiation").status,
        NegotiationStatus::Completed
    );
}

#[tokio::test]
async fn test_counts_never_exceed_total_while_running() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_delay(Duration::from_millis(15))
            .with_script("flinch", Script::Fail("runner crashed".to_string()))
            .with_script("nibble", Script::Timeout),
    );
    let orch = orchestrator(executor, 2);
    let n = orch
        .create_negotiation(
            "Sampling",
            scenario(&["reciprocity", "authority"], &["anchoring", "flinch", "nibble"]),
        )
        .await
        .expect("created");
    let queue = orch.start_negotiation(&n.id).await.expect("started");

    loop {
        let p = orch.queue_status(&queue.id).await.expect("status");
        assert!(p.completed_count + p.failed_count <= p.total_simulations);
        assert!(p.running_count <= 2);
        assert!(
            p.completed_count + p.failed_count + p.running_count + p.pending_count
                <= p.total_simulations,
            "{}",
            p.format_status()
        );
        if p.status.is_terminal() {
            assert_eq!(p.completed_count, 2);
            assert_eq!(p.failed_count, 4);
            break;
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    let results = orch.queue_results(&queue.id).await.expect("results");
    let timeouts = results
        .iter()
        .filter(|r| r.run.status == RunStatus::Timeout)
        .count();
    assert_eq!(timeouts, 2);
    assert!(results
        .iter()
        .filter(|r| r.run.status == RunStatus::Failed)
        .all(|r| r.run.error_message.as_deref().is_some_and(|m| m.contains("crashed"))));
}

#[tokio::test]
async fn test_older_queue_dispatches_first() {
    let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(2)));
    let orch = orchestrator(Arc::clone(&executor), 1);

    let first = orch
        .create_negotiation("First", scenario(&["reciprocity"], &["anchoring", "flinch", "nibble"]))
        .await
        .expect("created");
    let second = orch
        .create_negotiation("Second", scenario(&["authority"], &["anchoring", "flinch"]))
        .await
        .expect("created");
    let q1 = orch.start_negotiation(&first.id).await.expect("started");
    let q2 = orch.start_negotiation(&second.id).await.expect("started");

    wait_terminal(&orch, &q1.id).await;
    wait_terminal(&orch, &q2.id).await;

    let q1_runs: Vec<String> = orch
        .queue_results(&q1.id)
        .await
        .expect("results")
        .into_iter()
        .map(|r| r.run.id)
        .collect();
    let executed = executor.executed();
    assert_eq!(executed.len(), 5);
    assert_eq!(&executed[..3], q1_runs.as_slice());
}

#[tokio::test]
async fn test_walk_away_and_terminated_outcomes_complete() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_script(
                "flinch",
                Script::Outcome {
                    outcome: NegotiationOutcome::WalkAway,
                    rounds: 2,
                },
            )
            .with_script(
                "nibble",
                Script::Outcome {
                    outcome: NegotiationOutcome::Terminated,
                    rounds: 1,
                },
            ),
    );
    let orch = orchestrator(executor, 3);
    let n = orch
        .create_negotiation("Outcomes", scenario(&["reciprocity"], &["anchoring", "flinch", "nibble"]))
        .await
        .expect("created");
    let queue = orch.start_negotiation(&n.id).await.expect("started");
    let progress = wait_terminal(&orch, &queue.id).await;
    assert_eq!(progress.completed_count, 3);

    let results = orch.queue_results(&queue.id).await.expect("results");
    let outcomes: Vec<_> = results.iter().map(|r| r.run.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            Some(NegotiationOutcome::DealAccepted),
            Some(NegotiationOutcome::WalkAway),
            Some(NegotiationOutcome::Terminated),
        ]
    );
    assert!(results[0].run.evaluation.is_some());
    assert!(results[1].run.evaluation.is_some());
    assert!(results[2].run.evaluation.is_none(), "terminated runs are not evaluated");
    assert_eq!(results[2].run.total_rounds, Some(1));
}

#[tokio::test]
async fn test_restart_single_after_completion_reruns_once() {
    let executor = Arc::new(ScriptedExecutor::new());
    let orch = orchestrator(Arc::clone(&executor), 2);
    let n = orch
        .create_negotiation("Rerun", scenario(&["reciprocity"], &["anchoring", "flinch"]))
        .await
        .expect("created");
    let queue = orch.start_negotiation(&n.id).await.expect("started");
    wait_terminal(&orch, &queue.id).await;

    let results = orch.queue_results(&queue.id).await.expect("results");
    let target = results[1].run.id.clone();
    let reset = orch.restart_single(&target).await.expect("restart");
    assert_eq!(reset.status, RunStatus::Pending);
    assert_eq!(reset.attempt, 2);

    let progress = wait_terminal(&orch, &queue.id).await;
    assert_eq!(progress.status, QueueStatus::Completed);
    let run = orch.get_run(&target).await.expect("run");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.attempt, 2);
    assert_eq!(executor.executed().iter().filter(|id| **id == target).count(), 2);
}

#[tokio::test]
async fn test_events_follow_lifecycle_order() {
    let executor = Arc::new(ScriptedExecutor::new().gated());
    let orch = orchestrator(Arc::clone(&executor), 1);
    let mut events = orch.notifier().subscribe();

    let n = orch
        .create_negotiation("Events", scenario(&["reciprocity"], &["anchoring"]))
        .await
        .expect("created");
    let queue = orch.start_negotiation(&n.id).await.expect("started");
    wait_until("run in flight", || executor.in_flight() == 1).await;
    executor.release(1);
    wait_terminal(&orch, &queue.id).await;

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.negotiation_id, n.id);
        kinds.push(event.kind);
    }
    let position = |k: EventKind| kinds.iter().position(|x| *x == k);
    let created = position(EventKind::QueueCreated).expect("queue_created");
    let started = position(EventKind::QueueStarted).expect("queue_started");
    let run_started = position(EventKind::SimulationStarted).expect("simulation_started");
    let round = position(EventKind::SimulationRound).expect("simulation_round");
    let run_done = position(EventKind::SimulationCompleted).expect("simulation_completed");
    let done = position(EventKind::QueueCompleted).expect("queue_completed");
    assert!(created < started);
    assert!(started < run_started);
    assert!(run_started < round);
    assert!(round < run_done);
    assert!(run_done < done);
}
