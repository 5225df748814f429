#![forbid(unsafe_code)]

//! Node binary and embedding API for the ledgerflow platform.
//!
//! A node is one named participant: it owns a signing identity, a
//! checkpoint store, a session hub bound to a transport, a notary client
//! and a flow scheduler. [`run`] drives the standalone binary;
//! [`Node::start`] is the embedding entry point used by multi-node test
//! harnesses.

use std::sync::Arc;

use tracing::info;

use ledgerflow_session::InProcessTransport;

/// Configuration module
pub mod config;

/// Error module
pub mod error;

/// Logging module
pub mod logging;

/// Node assembly module
pub mod node;

// Re-export key types
pub use config::{NodeConfig, NotarySelection, StoreSelection};
pub use error::{NodeError, NodeResult};
pub use node::{create_checkpoint_store, Node};

/// Run function
pub async fn run(config: NodeConfig) -> NodeResult<()> {
    let transport = Arc::new(InProcessTransport::new());
    let node = Node::start(config, transport, Vec::new()).await?;

    info!(party = %node.party(), "node running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    node.shutdown().await;
    Ok(())
}
