//! Error type for node startup and lifecycle.

use ledgerflow_core::CoreError;
use thiserror::Error;

/// Errors surfaced while configuring, starting or stopping a node.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A platform component failed while the node was being wired up.
    #[error("Component error: {0}")]
    ComponentError(#[from] CoreError),

    /// The tracing subscriber could not be installed.
    #[error("Logging error: {0}")]
    LoggingError(String),

    /// An operating system call failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result alias used throughout the node crate.
pub type NodeResult<T> = Result<T, NodeError>;
