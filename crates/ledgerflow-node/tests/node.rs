//! Full node lifecycle: two configured nodes settling over a shared
//! carrier, signing faults surfacing as hospitalization, restart
//! recovery over a durable store, and wiring failures at startup.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use ledgerflow_core::{
    CheckpointStore, CoreError, FlowStatus, KeyId, PartyName, Payload, StateRef, Suspension,
    TransactionId,
};
use ledgerflow_engine::{EngineConfig, FlowContext, FlowEvent, FlowLogic, Transition};
use ledgerflow_node::{create_checkpoint_store, Node, NodeConfig, NodeError};
use ledgerflow_session::{InProcessTransport, SessionConfig};
use ledgerflow_signing::LocalKeystoreSigner;
use ledgerflow_test_utils::flows::{AcceptFlow, ProposeFlow};
use ledgerflow_test_utils::{await_deleted, await_status, ProposeParams, NODE_KEY_ID};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::tempdir;

/// Signs a fixed message on its first step, then completes.
struct StampFlow;

#[async_trait]
impl FlowLogic for StampFlow {
    fn flow_type(&self) -> &str {
        "test/stamp"
    }

    async fn start(&self, ctx: &mut FlowContext) -> Result<Transition, CoreError> {
        let signature = ctx.sign(&KeyId::new(NODE_KEY_ID), b"stamp").await?;
        Ok(Transition::Complete {
            result: json!({ "signature_len": signature.len() }),
        })
    }

    async fn resume(
        &self,
        _state: serde_json::Value,
        _event: FlowEvent,
        _ctx: &mut FlowContext,
    ) -> Result<Transition, CoreError> {
        Ok(Transition::Abort {
            reason: "stamp flows never suspend".into(),
        })
    }
}

/// Suspends on a timer, completes when it fires.
struct NapFlow {
    nap_ms: u64,
}

#[async_trait]
impl FlowLogic for NapFlow {
    fn flow_type(&self) -> &str {
        "test/nap"
    }

    async fn start(&self, _ctx: &mut FlowContext) -> Result<Transition, CoreError> {
        Ok(Transition::Suspend {
            state: json!({ "phase": "napping" }),
            awaiting: Suspension::Timer {
                duration_ms: self.nap_ms,
            },
        })
    }

    async fn resume(
        &self,
        _state: serde_json::Value,
        event: FlowEvent,
        _ctx: &mut FlowContext,
    ) -> Result<Transition, CoreError> {
        match event {
            FlowEvent::TimerFired => Ok(Transition::Complete {
                result: json!({ "rested": true }),
            }),
            other => Ok(Transition::Abort {
                reason: format!("unexpected event {}", other.kind()),
            }),
        }
    }
}

fn node_config(party: &str, keystore: &Path) -> NodeConfig {
    NodeConfig {
        party: party.to_string(),
        keystore_path: keystore.display().to_string(),
        engine: EngineConfig::fast(),
        session: SessionConfig::fast(),
        ..NodeConfig::default()
    }
}

fn write_keystore(path: &Path, key_ids: &[&str]) {
    let ids: Vec<KeyId> = key_ids.iter().map(|id| KeyId::new(*id)).collect();
    LocalKeystoreSigner::generate(path, &ids).unwrap();
}

#[tokio::test]
async fn two_nodes_settle_over_the_wire() {
    let dir = tempdir().unwrap();
    let keys = dir.path().join("keys.json");
    write_keystore(&keys, &[NODE_KEY_ID, "notary-key"]);

    let transport = Arc::new(InProcessTransport::new());
    let scenario: Vec<Arc<dyn FlowLogic>> = vec![Arc::new(ProposeFlow), Arc::new(AcceptFlow)];
    let alice = Node::start(
        node_config("Alice", &keys),
        Arc::clone(&transport),
        scenario.clone(),
    )
    .await
    .unwrap();
    let bob = Node::start(node_config("Bob", &keys), Arc::clone(&transport), scenario)
        .await
        .unwrap();
    assert_eq!(alice.party(), &PartyName::new("Alice"));

    let params = Payload::from_serialize(&ProposeParams {
        counterparty: "Bob".to_string(),
        amount: 11,
        input: StateRef::new(TransactionId::zero(), 4),
    })
    .unwrap();
    let flow = alice
        .scheduler()
        .start(Arc::new(ProposeFlow), params)
        .await
        .unwrap();

    let done = await_status(alice.scheduler(), &flow, FlowStatus::Completed).await;
    assert_eq!(done.flow_type, "trade/propose");
    assert_eq!(done.awaiting, None);
    assert_eq!(done.failure, None);

    bob.shutdown().await;
    alice.shutdown().await;
}

#[tokio::test]
async fn missing_signing_key_hospitalizes_the_flow() {
    let dir = tempdir().unwrap();
    let keys = dir.path().join("hollow-keys.json");
    write_keystore(&keys, &["notary-key"]);

    let transport = Arc::new(InProcessTransport::new());
    let node = Node::start(node_config("Alice", &keys), transport, Vec::new())
        .await
        .unwrap();

    let flow = node
        .scheduler()
        .start(Arc::new(StampFlow), Payload::null())
        .await
        .unwrap();

    let sick = await_status(node.scheduler(), &flow, FlowStatus::Hospitalized).await;
    assert_eq!(sick.retries, EngineConfig::fast().retry_budget);
    assert!(sick
        .failure
        .as_deref()
        .unwrap_or_default()
        .contains("Key not found"));

    node.shutdown().await;
}

#[tokio::test]
async fn restart_adopts_and_finishes_a_parked_flow() {
    let dir = tempdir().unwrap();
    let keys = dir.path().join("keys.json");
    write_keystore(&keys, &[NODE_KEY_ID, "notary-key"]);
    let mut config = node_config("Alice", &keys);
    config.checkpoint_store_url = format!("sqlite://{}", dir.path().join("flows.db").display());

    let transport = Arc::new(InProcessTransport::new());
    let first = Node::start(config.clone(), Arc::clone(&transport), Vec::new())
        .await
        .unwrap();
    let flow = first
        .scheduler()
        .start(Arc::new(NapFlow { nap_ms: 300 }), Payload::null())
        .await
        .unwrap();
    await_status(first.scheduler(), &flow, FlowStatus::Suspended).await;
    first.shutdown().await;

    let second = Node::start(
        config.clone(),
        Arc::clone(&transport),
        vec![Arc::new(NapFlow { nap_ms: 300 }) as Arc<dyn FlowLogic>],
    )
    .await
    .unwrap();
    await_status(second.scheduler(), &flow, FlowStatus::Completed).await;
    second.shutdown().await;

    // The durable image carries the result.
    let (store, connection) = create_checkpoint_store(&config).await.unwrap();
    let image = store.load(&flow).await.unwrap().unwrap();
    assert_eq!(image.state, json!({ "rested": true }));
    if let Some(connection) = connection {
        connection.close().await;
    }
}

#[tokio::test]
async fn delete_completed_config_reaps_finished_flows() {
    let dir = tempdir().unwrap();
    let keys = dir.path().join("keys.json");
    write_keystore(&keys, &[NODE_KEY_ID, "notary-key"]);
    let mut config = node_config("Alice", &keys);
    config.engine = EngineConfig {
        delete_completed: true,
        ..EngineConfig::fast()
    };

    let transport = Arc::new(InProcessTransport::new());
    let node = Node::start(config, transport, Vec::new()).await.unwrap();
    let flow = node
        .scheduler()
        .start(Arc::new(NapFlow { nap_ms: 10 }), Payload::null())
        .await
        .unwrap();

    await_deleted(node.scheduler(), &flow).await;
    node.shutdown().await;
}

#[tokio::test]
async fn startup_fails_cleanly_when_the_keystore_is_missing() {
    let config = node_config("Alice", Path::new("/nonexistent/keys.json"));
    let err = Node::start(config, Arc::new(InProcessTransport::new()), Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::ComponentError(_)));
    assert!(err.to_string().contains("keystore"));
}
