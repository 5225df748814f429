//! The contract between flow authors and the scheduler.
//!
//! A flow is written as an explicit state machine. Each step receives
//! the state persisted at the previous suspension point plus the event
//! that woke the flow, stages its effects on the [`FlowContext`], and
//! ends in a [`Transition`]. Everything the next step needs must travel
//! in the serialized state value; the logic object itself holds no
//! per-instance data.

use async_trait::async_trait;
use ledgerflow_core::{CoreError, NotarisationResult, Payload, SessionId, Suspension, TransactionId};
use serde_json::Value;

use crate::context::FlowContext;

/// How a step ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Park the flow until `awaiting` produces an event.
    Suspend {
        /// Serialized logic state to persist with the checkpoint.
        state: Value,
        /// What the flow is waiting for.
        awaiting: Suspension,
    },
    /// The flow is done.
    Complete {
        /// Result recorded in the final checkpoint.
        result: Value,
    },
    /// The flow gives up. Definitive, never retried.
    Abort {
        /// Recorded as the flow's failure reason.
        reason: String,
    },
}

/// What woke a suspended flow.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    /// The next in-order message on the awaited session.
    MessageDelivered {
        /// Session the message arrived on.
        session_id: SessionId,
        /// Message body.
        payload: Payload,
    },
    /// The awaited session is gone, either broken by delivery failure
    /// or ended by the counterparty while a receive was pending.
    SessionBroken {
        /// The dead session.
        session_id: SessionId,
        /// Why it is dead.
        reason: String,
    },
    /// The notary's verdict on the submitted request.
    NotaryResponse {
        /// Transaction the verdict concerns.
        transaction_id: TransactionId,
        /// The verdict.
        result: NotarisationResult,
    },
    /// The armed timer elapsed.
    TimerFired,
    /// The wait bound on a receive or notarise suspension expired
    /// before the awaited input arrived.
    TimedOut {
        /// The suspension that timed out.
        awaiting: Suspension,
    },
    /// An operator asked the flow to stop. The step may complete or
    /// abort on its own terms; suspending again is overridden and the
    /// flow fails as cancelled.
    CancellationRequested,
}

impl FlowEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowEvent::MessageDelivered { .. } => "message_delivered",
            FlowEvent::SessionBroken { .. } => "session_broken",
            FlowEvent::NotaryResponse { .. } => "notary_response",
            FlowEvent::TimerFired => "timer_fired",
            FlowEvent::TimedOut { .. } => "timed_out",
            FlowEvent::CancellationRequested => "cancellation_requested",
        }
    }
}

/// A resumable state machine executed by the scheduler.
///
/// Implementations are registered once per flow type and shared by all
/// instances of that type, so they must be stateless apart from
/// configuration fixed at registration.
#[async_trait]
pub trait FlowLogic: Send + Sync {
    /// Registered name of this flow type, e.g. `transfer/propose`.
    fn flow_type(&self) -> &str;

    /// First step of a fresh flow. Start parameters are available as
    /// [`FlowContext::params`]; responder flows find their inbound
    /// session via [`FlowContext::accepted_session`].
    async fn start(&self, ctx: &mut FlowContext) -> Result<Transition, CoreError>;

    /// Runs the step at the current suspension point.
    async fn resume(
        &self,
        state: Value,
        event: FlowEvent,
        ctx: &mut FlowContext,
    ) -> Result<Transition, CoreError>;
}
