//! Events the session layer raises towards the flow engine.

use ledgerflow_core::{FlowId, PartyName, SessionId};

/// What the hub tells the engine. Events for one session are emitted in
/// order; there is no ordering across sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A counterparty opened a session naming a responder flow type. The
    /// engine starts the responder flow and binds it to the session with
    /// [`SessionHub::accept`](crate::SessionHub::accept).
    OpenRequested {
        /// The new session.
        session_id: SessionId,
        /// Who opened it.
        initiator: PartyName,
        /// Responder flow type to start.
        flow_type: String,
    },

    /// The next in-order frame of a session became available. A wakeup,
    /// not a handoff: the engine polls the hub to read it, and duplicate
    /// wakeups are harmless.
    Delivered {
        /// Session with a deliverable frame.
        session_id: SessionId,
        /// Flow bound to the session, when known.
        owner: Option<FlowId>,
    },

    /// The counterparty closed the session cleanly and all of its data
    /// frames have been consumed.
    PeerClosed {
        /// The closed session.
        session_id: SessionId,
        /// Flow bound to the session, when known.
        owner: Option<FlowId>,
    },

    /// The retransmission budget ran out; the session is dead and the
    /// owning flow must be told.
    Broken {
        /// The broken session.
        session_id: SessionId,
        /// Flow bound to the session, when known.
        owner: Option<FlowId>,
        /// Why it broke.
        reason: String,
    },
}

impl SessionEvent {
    /// The session this event concerns.
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::OpenRequested { session_id, .. }
            | SessionEvent::Delivered { session_id, .. }
            | SessionEvent::PeerClosed { session_id, .. }
            | SessionEvent::Broken { session_id, .. } => session_id,
        }
    }
}
