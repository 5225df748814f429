use anyhow::{Context, Result};
use ledgerflow_node::{logging, NodeConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from environment variables
    let config = NodeConfig::load().context("Failed to load configuration")?;

    // Set up logging before anything else emits events
    logging::init(&config).context("Failed to initialize logging")?;

    // Run the node until ctrl-c
    ledgerflow_node::run(config).await.context("Node error")?;

    Ok(())
}
