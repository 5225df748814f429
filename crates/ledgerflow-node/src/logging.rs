//! Structured logging setup using tracing.

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured log level when set. Call this once
/// per process; a second call fails because the global subscriber is
/// already installed.
pub fn init(config: &NodeConfig) -> NodeResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if config.log_json {
        // JSON logs for aggregation
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true);
        tracing::subscriber::set_global_default(registry.with(json_layer))
    } else {
        // Pretty logs for development
        let fmt_layer = fmt::layer().pretty().with_target(true);
        tracing::subscriber::set_global_default(registry.with(fmt_layer))
    };
    installed.map_err(|err| NodeError::LoggingError(err.to_string()))?;

    info!(
        log_format = if config.log_json { "json" } else { "pretty" },
        "logging initialized"
    );
    Ok(())
}
