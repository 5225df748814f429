//! Multi-node rig over the in-process carrier.
//!
//! [`TestCluster`] wires any number of parties to one transport and one
//! embedded notary, each with a fast-tuned scheduler, an in-memory
//! store and the scenario flows pre-registered. Tests talk to a node's
//! scheduler directly and watch checkpoints to observe progress.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ledgerflow_core::{
    AllowAll, CheckpointStore, CheckpointSummary, FlowId, FlowStatus, KeyId, NotaryClient,
    PartyName,
};
use ledgerflow_engine::{EngineConfig, FlowScheduler};
use ledgerflow_notary::{EmbeddedNotary, LocalNotaryClient};
use ledgerflow_session::{
    FaultMode, InProcessTransport, MessageTransport, SessionConfig, SessionHub,
};
use ledgerflow_store_inmemory::InMemoryCheckpointStore;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::flows::{register_scenario_flows, NODE_KEY_ID};
use crate::signer::{key_seed, TestSigner};

const EVENT_CAPACITY: usize = 128;
const POLL_INTERVAL: Duration = Duration::from_millis(5);
const POLL_BUDGET: usize = 800;

/// One live party: scheduler with all pumps running, plus direct access
/// to its checkpoint store for assertions.
pub struct ClusterNode {
    /// The party this node speaks for.
    pub party: PartyName,
    /// The node's scheduler, pumps already spawned.
    pub scheduler: Arc<FlowScheduler>,
    /// The node's checkpoint store.
    pub store: Arc<dyn CheckpointStore>,
}

/// A set of nodes sharing one transport and one notary.
pub struct TestCluster {
    transport: Arc<InProcessTransport>,
    notary: Arc<EmbeddedNotary>,
    client: Arc<dyn NotaryClient>,
    nodes: HashMap<String, ClusterNode>,
}

impl Default for TestCluster {
    fn default() -> Self {
        TestCluster::new()
    }
}

impl TestCluster {
    /// Empty cluster with a fresh transport and embedded notary.
    pub fn new() -> Self {
        let notary = EmbeddedNotary::new(
            PartyName::new("Notary"),
            KeyId::new("notary-key"),
            Arc::new(TestSigner::new().with_key("notary-key", key_seed("cluster-notary"))),
        );
        let client: Arc<dyn NotaryClient> = Arc::new(LocalNotaryClient::new(Arc::clone(&notary)));
        TestCluster {
            transport: Arc::new(InProcessTransport::new()),
            notary,
            client,
            nodes: HashMap::new(),
        }
    }

    /// Adds a node with fast-tuned engine settings.
    pub fn add_node(&mut self, name: &str) -> &ClusterNode {
        self.add_node_with_config(name, EngineConfig::fast())
    }

    /// Adds a node with explicit engine settings. The node signs with
    /// [`NODE_KEY_ID`], seeded from its own name so every party's key
    /// is distinct but reproducible.
    pub fn add_node_with_config(&mut self, name: &str, config: EngineConfig) -> &ClusterNode {
        let party = PartyName::new(name);
        let inbox = self.transport.register(party.clone());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let hub = SessionHub::new(
            party.clone(),
            SessionConfig::fast(),
            Arc::clone(&self.transport) as Arc<dyn MessageTransport>,
            events_tx,
        );
        hub.spawn_pump(inbox);
        hub.spawn_retransmit_loop();
        let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
        let scheduler = FlowScheduler::new(
            party.clone(),
            config,
            Arc::clone(&store),
            hub,
            Arc::clone(&self.client),
            Arc::new(TestSigner::new().with_key(NODE_KEY_ID, key_seed(name))),
            Arc::new(AllowAll),
        );
        scheduler.spawn_wakeup_pump();
        scheduler.spawn_session_pump(events_rx);
        scheduler.spawn_lease_renewal();
        register_scenario_flows(&scheduler);
        self.nodes.insert(
            name.to_string(),
            ClusterNode {
                party,
                scheduler,
                store,
            },
        );
        self.node(name)
    }

    /// Looks up a node by name.
    ///
    /// # Panics
    ///
    /// Panics when no node of that name was added.
    pub fn node(&self, name: &str) -> &ClusterNode {
        match self.nodes.get(name) {
            Some(node) => node,
            None => panic!("no node named {name} in the cluster"),
        }
    }

    /// The shared carrier, for registering parties outside the cluster.
    pub fn transport(&self) -> &Arc<InProcessTransport> {
        &self.transport
    }

    /// The shared notary service.
    pub fn notary(&self) -> &Arc<EmbeddedNotary> {
        &self.notary
    }

    /// A client for the shared notary.
    pub fn notary_client(&self) -> Arc<dyn NotaryClient> {
        Arc::clone(&self.client)
    }

    /// Arms a one-shot delivery fault on the carrier.
    pub async fn inject_fault(&self, fault: FaultMode) {
        self.transport.inject_fault(fault).await;
    }

    /// Blackholes frames to the named party until [`reconnect`].
    ///
    /// [`reconnect`]: TestCluster::reconnect
    pub fn disconnect(&self, name: &str) {
        self.transport.disconnect(&PartyName::new(name));
    }

    /// Restores delivery to the named party.
    pub fn reconnect(&self, name: &str) {
        self.transport.reconnect(&PartyName::new(name));
    }
}

/// Polls until the flow's checkpoint reports `status`, returning its
/// summary.
///
/// # Panics
///
/// Panics when the status is not reached within the poll budget.
pub async fn await_status(
    scheduler: &FlowScheduler,
    flow: &FlowId,
    status: FlowStatus,
) -> CheckpointSummary {
    for _ in 0..POLL_BUDGET {
        if let Ok(Some(summary)) = scheduler.status(flow).await {
            if summary.status == status {
                return summary;
            }
        }
        sleep(POLL_INTERVAL).await;
    }
    panic!("flow {flow} never reached {status}");
}

/// Polls until the flow's checkpoint is gone.
///
/// # Panics
///
/// Panics when the checkpoint is still present after the poll budget.
pub async fn await_deleted(scheduler: &FlowScheduler, flow: &FlowId) {
    for _ in 0..POLL_BUDGET {
        if let Ok(None) = scheduler.status(flow).await {
            return;
        }
        sleep(POLL_INTERVAL).await;
    }
    panic!("checkpoint for flow {flow} never disappeared");
}
