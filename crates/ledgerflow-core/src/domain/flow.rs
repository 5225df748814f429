//! Flow identity, lifecycle states and suspension reasons.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::notary::NotarisationRequest;
use crate::domain::session::SessionId;

/// Unique identifier for a flow instance, assigned when the flow starts and
/// stable across suspensions, retries and node restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl FlowId {
    /// Generates a fresh flow identifier.
    pub fn new() -> Self {
        FlowId(Uuid::new_v4().to_string())
    }

    /// Borrows the underlying identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FlowId {
    fn from(id: &str) -> Self {
        FlowId(id.to_string())
    }
}

/// Lifecycle state of a flow.
///
/// The live lifecycle is `Created -> Running -> (Suspended <-> Running)* ->
/// Completed | Failed`. A failed step moves the flow to `Retrying`; when the
/// retry budget is exhausted the flow is parked as `Hospitalized` until an
/// operator retries or cancels it. `Running` is an in-memory state only and
/// is never written to the checkpoint store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowStatus {
    /// Start was accepted and the initial checkpoint written, but the first
    /// step has not completed yet.
    Created,
    /// A step is executing on some worker.
    Running,
    /// Parked at a suspension point, waiting for an external event.
    Suspended,
    /// A step failed and will be re-run from the latest checkpoint.
    Retrying,
    /// Retries were exhausted; the flow is parked for operator attention.
    Hospitalized,
    /// The flow finished and produced a result.
    Completed,
    /// The flow failed definitively or was cancelled.
    Failed,
}

impl FlowStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowStatus::Completed | FlowStatus::Failed)
    }

    /// States in which the scheduler still owes the flow work.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != FlowStatus::Hospitalized
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowStatus::Created => "CREATED",
            FlowStatus::Running => "RUNNING",
            FlowStatus::Suspended => "SUSPENDED",
            FlowStatus::Retrying => "RETRYING",
            FlowStatus::Hospitalized => "HOSPITALIZED",
            FlowStatus::Completed => "COMPLETED",
            FlowStatus::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

/// What a suspended flow is waiting for.
///
/// The suspension reason is written into the checkpoint so that recovery can
/// re-arm the wait: re-registering session interest, re-submitting the
/// notarisation request or re-scheduling the timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Suspension {
    /// Waiting for the next inbound message on a session.
    Receive {
        /// Session the flow is reading from.
        session_id: SessionId,
        /// Optional wait bound; on expiry the flow is resumed with a
        /// timed-out event instead of a message.
        timeout_ms: Option<u64>,
    },
    /// Waiting for the notary's verdict on a submitted transaction.
    Notarise {
        /// The request that was (or will be, after recovery) submitted.
        request: NotarisationRequest,
        /// Optional wait bound for the notary round trip.
        timeout_ms: Option<u64>,
    },
    /// Waiting for a relative timer to fire.
    Timer {
        /// Delay before the flow is resumed.
        duration_ms: u64,
    },
}

impl Suspension {
    /// Short label for logs and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Suspension::Receive { .. } => "receive",
            Suspension::Notarise { .. } => "notarise",
            Suspension::Timer { .. } => "timer",
        }
    }

    /// The wait bound for this suspension, if any.
    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            Suspension::Receive { timeout_ms, .. } => *timeout_ms,
            Suspension::Notarise { timeout_ms, .. } => *timeout_ms,
            Suspension::Timer { duration_ms } => Some(*duration_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_flow_ids_are_unique() {
        assert_ne!(FlowId::new(), FlowId::new());
    }

    #[test]
    fn terminal_states() {
        assert!(FlowStatus::Completed.is_terminal());
        assert!(FlowStatus::Failed.is_terminal());
        assert!(!FlowStatus::Suspended.is_terminal());
        assert!(!FlowStatus::Hospitalized.is_terminal());
    }

    #[test]
    fn hospitalized_is_not_active() {
        assert!(!FlowStatus::Hospitalized.is_active());
        assert!(FlowStatus::Suspended.is_active());
        assert!(FlowStatus::Retrying.is_active());
    }

    #[test]
    fn suspension_kind_labels() {
        let timer = Suspension::Timer { duration_ms: 250 };
        assert_eq!(timer.kind(), "timer");
        assert_eq!(timer.timeout_ms(), Some(250));

        let receive = Suspension::Receive {
            session_id: SessionId::new(),
            timeout_ms: None,
        };
        assert_eq!(receive.kind(), "receive");
        assert_eq!(receive.timeout_ms(), None);
    }

    #[test]
    fn status_serializes_as_variant_name() {
        let json = serde_json::to_string(&FlowStatus::Hospitalized).unwrap();
        assert_eq!(json, "\"Hospitalized\"");
    }
}
