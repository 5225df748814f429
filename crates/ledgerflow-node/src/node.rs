//! Node assembly and lifecycle.
//!
//! [`Node::start`] wires the configured store, signing backend, notary
//! client, session hub and flow scheduler together, recovers any flows
//! this party already owns and brings the background pumps up. The node
//! then runs until [`Node::shutdown`].

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use ledgerflow_core::{
    AllowAll, CheckpointStore, KeyId, NotaryClient, PartyName, SigningService,
};
use ledgerflow_engine::{FlowLogic, FlowScheduler};
use ledgerflow_notary::{
    EmbeddedNotary, HttpNotaryClient, LocalNotaryClient, RetryingNotaryClient,
};
use ledgerflow_session::{InProcessTransport, MessageTransport, SessionHub};
use ledgerflow_signing::build_signing_service;
use ledgerflow_store_inmemory::InMemoryCheckpointStore;
use ledgerflow_store_sqlite::{SqliteCheckpointStore, SqliteConnection};

use crate::config::{NodeConfig, NotarySelection, StoreSelection};
use crate::error::NodeResult;

/// Capacity of the session event channel between hub and scheduler.
const EVENT_CAPACITY: usize = 256;

/// A running ledgerflow participant.
pub struct Node {
    party: PartyName,
    scheduler: Arc<FlowScheduler>,
    sqlite: Option<SqliteConnection>,
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("party", &self.party)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Builds every component from `config`, registers the given flow
    /// logics, recovers flows this party owns and starts serving.
    ///
    /// Registration happens before recovery so adopted flows find their
    /// logic on the first redriven step.
    pub async fn start(
        config: NodeConfig,
        transport: Arc<InProcessTransport>,
        logics: Vec<Arc<dyn FlowLogic>>,
    ) -> NodeResult<Node> {
        let party = PartyName::new(config.party.clone());
        info!(party = %party, "starting node");

        let signer = build_signing_service(&config.signing()?)?;
        let (store, sqlite) = create_checkpoint_store(&config).await?;
        let notary = create_notary_client(&config, Arc::clone(&signer))?;

        let inbox = transport.register(party.clone());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let hub = SessionHub::new(
            party.clone(),
            config.session.clone(),
            Arc::clone(&transport) as Arc<dyn MessageTransport>,
            events_tx,
        );

        let scheduler = FlowScheduler::new(
            party.clone(),
            config.engine.clone(),
            Arc::clone(&store),
            Arc::clone(&hub),
            notary,
            signer,
            Arc::new(AllowAll),
        );
        for logic in logics {
            scheduler.register(logic);
        }

        let tasks = vec![
            hub.spawn_pump(inbox),
            hub.spawn_retransmit_loop(),
            scheduler.spawn_wakeup_pump(),
            scheduler.spawn_session_pump(events_rx),
            scheduler.spawn_lease_renewal(),
        ];

        let adopted = scheduler.recover().await?;
        if adopted > 0 {
            info!(party = %party, adopted, "recovered resident flows");
        }

        Ok(Node {
            party,
            scheduler,
            sqlite,
            tasks,
        })
    }

    /// The party this node speaks for.
    pub fn party(&self) -> &PartyName {
        &self.party
    }

    /// The flow scheduler, for starting and operating on flows.
    pub fn scheduler(&self) -> &Arc<FlowScheduler> {
        &self.scheduler
    }

    /// Registers additional flow logic on the running node.
    pub fn register(&self, logic: Arc<dyn FlowLogic>) {
        self.scheduler.register(logic);
    }

    /// Stops intake, drains in-flight flow steps and closes the store.
    pub async fn shutdown(self) {
        info!(party = %self.party, "node shutting down");
        for task in &self.tasks {
            task.abort();
        }
        self.scheduler.quiesce().await;
        if let Some(conn) = self.sqlite {
            conn.close().await;
        }
        info!(party = %self.party, "node stopped");
    }
}

/// Create the checkpoint store selected by the configuration.
///
/// The sqlite connection is returned alongside the trait object so the
/// node can close it on shutdown.
pub async fn create_checkpoint_store(
    config: &NodeConfig,
) -> NodeResult<(Arc<dyn CheckpointStore>, Option<SqliteConnection>)> {
    match config.checkpoint_store()? {
        StoreSelection::Memory => {
            info!("Using in-memory checkpoint store");
            Ok((Arc::new(InMemoryCheckpointStore::new()), None))
        }
        StoreSelection::Sqlite(path) => {
            info!(path = %path.display(), "Using sqlite checkpoint store");
            let store = SqliteCheckpointStore::open(&path).await?;
            let conn = store.connection().clone();
            Ok((Arc::new(store), Some(conn)))
        }
    }
}

/// Create the notary client selected by the configuration.
///
/// The embedded notary signs verdicts with this node's own signing
/// service. The HTTP client wraps the remote endpoint in the configured
/// retry policy.
pub fn create_notary_client(
    config: &NodeConfig,
    signer: Arc<dyn SigningService>,
) -> NodeResult<Arc<dyn NotaryClient>> {
    match config.notary()? {
        NotarySelection::Embedded => {
            info!(identity = %config.notary_party, "Using embedded notary");
            let notary = EmbeddedNotary::new(
                PartyName::new(config.notary_party.clone()),
                KeyId::new(config.notary_key_id.clone()),
                signer,
            );
            Ok(Arc::new(LocalNotaryClient::new(notary)))
        }
        NotarySelection::Http(url) => {
            info!(url = %url, "Using HTTP notary");
            let http = HttpNotaryClient::new(url, config.notary_timeout())?;
            Ok(Arc::new(RetryingNotaryClient::new(
                Arc::new(http),
                config.notary_retry.clone(),
            )))
        }
    }
}
