//! The cluster rig driving the scenario flows end to end: settlement
//! between two parties, ping-pong diagnostics, double-spend conflicts
//! and carrier faults.

use std::sync::Arc;
use std::time::Duration;

use ledgerflow_core::{
    CheckpointSummary, FlowId, FlowStatus, Payload, StateRef, TransactionId, TransactionPayload,
};
use ledgerflow_engine::FlowScheduler;
use ledgerflow_session::FaultMode;
use ledgerflow_test_utils::flows::{PingFlow, ProposeFlow};
use ledgerflow_test_utils::{await_status, ProposeParams, TestCluster};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::sleep;

/// Polls until the flow is out of the running states, whichever way it
/// ended.
async fn await_terminal(scheduler: &FlowScheduler, flow: &FlowId) -> CheckpointSummary {
    for _ in 0..800 {
        if let Ok(Some(summary)) = scheduler.status(flow).await {
            match summary.status {
                FlowStatus::Completed | FlowStatus::Failed => return summary,
                _ => {}
            }
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("flow {flow} never reached a terminal status");
}

fn propose_params(counterparty: &str, amount: i64, input: StateRef) -> Payload {
    Payload::from_serialize(&ProposeParams {
        counterparty: counterparty.to_string(),
        amount,
        input,
    })
    .unwrap()
}

#[tokio::test]
async fn propose_accept_settles_between_two_nodes() {
    let mut cluster = TestCluster::new();
    cluster.add_node("Alice");
    cluster.add_node("Bob");

    let input = StateRef::new(TransactionId::zero(), 1);
    let alice = cluster.node("Alice");
    let flow = alice
        .scheduler
        .start(Arc::new(ProposeFlow), propose_params("Bob", 42, input.clone()))
        .await
        .unwrap();

    await_status(&alice.scheduler, &flow, FlowStatus::Completed).await;
    let done = alice.store.load(&flow).await.unwrap().unwrap();
    assert_eq!(done.state["settled"], json!(42));
    assert!(done.state["transaction_id"].is_string());

    // Bob's responder half completed on its own node.
    let bob = cluster.node("Bob");
    for _ in 0..800 {
        let completed = bob.store.list(Some(FlowStatus::Completed)).await.unwrap();
        if let Some(summary) = completed
            .iter()
            .find(|summary| summary.flow_type == "trade/accept")
        {
            let responder = bob.store.load(&summary.flow_id).await.unwrap().unwrap();
            assert_eq!(responder.state, json!({ "accepted": 42 }));

            // The input is claimed at the notary; a rival spend loses.
            let rival = TransactionPayload::new(vec![input], vec![Payload::new(json!("rival"))])
                .id()
                .unwrap();
            let conflicts = cluster
                .notary()
                .uniqueness()
                .claim(rival, &[StateRef::new(TransactionId::zero(), 1)])
                .await
                .unwrap_err();
            assert_eq!(conflicts.len(), 1);
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("responder flow never completed on Bob");
}

#[tokio::test]
async fn ping_pong_round_trip() {
    let mut cluster = TestCluster::new();
    cluster.add_node("Alice");
    cluster.add_node("Bob");

    let alice = cluster.node("Alice");
    let flow = alice
        .scheduler
        .start(
            Arc::new(PingFlow),
            Payload::new(json!({ "counterparty": "Bob", "nonce": 9 })),
        )
        .await
        .unwrap();

    await_status(&alice.scheduler, &flow, FlowStatus::Completed).await;
    let done = alice.store.load(&flow).await.unwrap().unwrap();
    assert_eq!(done.state, json!({ "pong": { "nonce": 9 } }));
}

#[tokio::test]
async fn double_spend_leaves_exactly_one_winner() {
    let mut cluster = TestCluster::new();
    cluster.add_node("Alice");
    cluster.add_node("Bob");

    let input = StateRef::new(TransactionId::zero(), 7);
    let alice_flow = cluster
        .node("Alice")
        .scheduler
        .start(Arc::new(ProposeFlow), propose_params("Bob", 1, input.clone()))
        .await
        .unwrap();
    let bob_flow = cluster
        .node("Bob")
        .scheduler
        .start(Arc::new(ProposeFlow), propose_params("Alice", 2, input))
        .await
        .unwrap();

    let alice_done = await_terminal(&cluster.node("Alice").scheduler, &alice_flow).await;
    let bob_done = await_terminal(&cluster.node("Bob").scheduler, &bob_flow).await;

    let statuses = [alice_done.status, bob_done.status];
    assert!(
        statuses.contains(&FlowStatus::Completed) && statuses.contains(&FlowStatus::Failed),
        "expected one winner and one loser, got {statuses:?}"
    );
    let loser = if alice_done.status == FlowStatus::Failed {
        alice_done
    } else {
        bob_done
    };
    assert!(loser
        .failure
        .as_deref()
        .unwrap_or_default()
        .contains("Consensus conflict"));
    assert_eq!(loser.retries, 0);
}

#[tokio::test]
async fn duplicated_frames_reach_the_responder_once() {
    let mut cluster = TestCluster::new();
    cluster.add_node("Alice");
    cluster.add_node("Bob");
    cluster.inject_fault(FaultMode::DuplicateNextData).await;

    let alice = cluster.node("Alice");
    let flow = alice
        .scheduler
        .start(
            Arc::new(PingFlow),
            Payload::new(json!({ "counterparty": "Bob", "nonce": 3 })),
        )
        .await
        .unwrap();

    await_status(&alice.scheduler, &flow, FlowStatus::Completed).await;

    // One responder flow on Bob, none failed by a replayed frame.
    let bob = cluster.node("Bob");
    for _ in 0..800 {
        let completed = bob.store.list(Some(FlowStatus::Completed)).await.unwrap();
        if completed.iter().any(|s| s.flow_type == "diag/pong") {
            let failed = bob.store.list(Some(FlowStatus::Failed)).await.unwrap();
            assert_eq!(failed, vec![]);
            assert_eq!(completed.len(), 1);
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("responder flow never completed on Bob");
}

#[tokio::test]
async fn reconnect_restores_delivery_after_a_blackhole() {
    let mut cluster = TestCluster::new();
    cluster.add_node("Alice");
    cluster.add_node("Bob");
    cluster.disconnect("Bob");

    let alice = cluster.node("Alice");
    let dead = alice
        .scheduler
        .start(
            Arc::new(PingFlow),
            Payload::new(json!({ "counterparty": "Bob", "nonce": 1 })),
        )
        .await
        .unwrap();
    let failed = await_status(&alice.scheduler, &dead, FlowStatus::Failed).await;
    assert!(failed
        .failure
        .as_deref()
        .unwrap_or_default()
        .contains("unexpected event session_broken"));

    cluster.reconnect("Bob");
    let revived = alice
        .scheduler
        .start(
            Arc::new(PingFlow),
            Payload::new(json!({ "counterparty": "Bob", "nonce": 2 })),
        )
        .await
        .unwrap();
    await_status(&alice.scheduler, &revived, FlowStatus::Completed).await;
}
