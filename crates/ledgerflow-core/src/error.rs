//! Error taxonomy shared across the Ledgerflow platform.
//!
//! Every failure a component can surface is mapped onto [`CoreError`] and,
//! for scheduling purposes, onto a [`FailureClass`]. The class decides what
//! the flow scheduler does with a failed step: retry it from the latest
//! checkpoint, deliver it to the flow as a recoverable signal, or park the
//! flow for operator attention.

use thiserror::Error;

use crate::domain::flow::FlowId;
use crate::domain::notary::StateConflict;
use crate::domain::session::SessionId;
use crate::domain::transaction::TransactionId;

/// Core error type for the Ledgerflow platform.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// No checkpoint exists for the requested flow.
    #[error("Flow not found: {0}")]
    FlowNotFound(FlowId),

    /// The flow is already live on this or another worker.
    #[error("Flow is already running: {0}")]
    AlreadyRunning(FlowId),

    /// A lifecycle transition was attempted from a state that does not
    /// permit it.
    #[error("Invalid flow state: {0}")]
    InvalidState(String),

    /// The checkpoint store failed in a way that is worth retrying.
    #[error("Checkpoint store error: {0}")]
    StoreError(String),

    /// A checkpoint write lost the monotonic-sequence race. The caller no
    /// longer owns the flow and must not retry the write.
    #[error("Stale checkpoint for flow {flow_id}: attempted sequence {attempted}, latest is {latest}")]
    StaleCheckpoint {
        /// Flow whose checkpoint was superseded.
        flow_id: FlowId,
        /// Sequence number the writer attempted to persist.
        attempted: u64,
        /// Latest sequence number already persisted.
        latest: u64,
    },

    /// Encoding or decoding of a durable or wire value failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A session was declared broken after its retransmission budget ran
    /// out, or the counterparty closed it while messages were outstanding.
    #[error("Session {session_id} failed: {reason}")]
    SessionFailure {
        /// The failed session.
        session_id: SessionId,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The notary rejected the transaction because at least one input state
    /// was already consumed. This outcome is definitive.
    #[error("Consensus conflict for transaction {transaction_id}: {} input state(s) already consumed", conflicting.len())]
    ConsensusConflict {
        /// The rejected transaction.
        transaction_id: TransactionId,
        /// Every contested input state and the transaction that consumed it.
        conflicting: Vec<StateConflict>,
    },

    /// The authorization hook vetoed the operation.
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// The signing backend refused or failed to produce a signature.
    #[error("Signing failure: {0}")]
    SigningFailure(String),

    /// Flow logic raised an error the platform does not recognise.
    #[error("Flow logic error: {0}")]
    FlowLogicError(String),

    /// A network carrier fault (notary HTTP call, remote signer, peer
    /// delivery) that did not produce a protocol-level answer.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// A platform-level wait expired before the awaited input arrived.
    #[error("Timed out: {0}")]
    TimeoutError(String),

    /// The flow was cancelled by an operator.
    #[error("Flow cancelled: {0}")]
    Cancelled(FlowId),

    /// Node or component configuration is unusable.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error outside the checkpoint store.
    #[error("IO error: {0}")]
    IOError(String),
}

/// How the flow scheduler should react to a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Infrastructure hiccup. Retry the same operation with backoff before
    /// giving up.
    Transient,
    /// A session broke. Deliver the failure to the owning flow as an event
    /// and let its logic decide; do not fail the flow outright.
    Session,
    /// Retrying cannot change the outcome. Fail the flow.
    Definitive,
    /// The flow step itself failed. Re-run it from the latest checkpoint up
    /// to the retry budget, then hospitalize the flow.
    Logic,
}

impl CoreError {
    /// Classifies this error for the scheduler's retry decision.
    pub fn classify(&self) -> FailureClass {
        match self {
            CoreError::StoreError(_)
            | CoreError::TransportError(_)
            | CoreError::TimeoutError(_)
            | CoreError::IOError(_) => FailureClass::Transient,
            CoreError::SessionFailure { .. } => FailureClass::Session,
            CoreError::ConsensusConflict { .. }
            | CoreError::PolicyViolation(_)
            | CoreError::SerializationError(_)
            | CoreError::Cancelled(_)
            | CoreError::ConfigError(_)
            | CoreError::InvalidState(_)
            | CoreError::StaleCheckpoint { .. }
            | CoreError::FlowNotFound(_)
            | CoreError::AlreadyRunning(_) => FailureClass::Definitive,
            CoreError::FlowLogicError(_) | CoreError::SigningFailure(_) => FailureClass::Logic,
        }
    }

    /// True when the scheduler may re-run the failed step from the latest
    /// checkpoint (transient faults and flow-logic failures).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.classify(),
            FailureClass::Transient | FailureClass::Logic
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::IOError(err.to_string())
    }
}
