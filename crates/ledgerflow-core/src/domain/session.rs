//! Session model: identifiers, wire envelopes and durable snapshots.
//!
//! A session is a bidirectional, ordered channel between two flows on
//! different nodes. The session layer assigns every outbound data frame a
//! per-session sequence number; receivers deduplicate and reorder on those
//! numbers and acknowledge cumulatively. Everything the session layer needs
//! to survive a restart lives in [`SessionSnapshot`], which is embedded in
//! the owning flow's checkpoint.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::identity::PartyName;
use crate::types::Payload;

/// Unique identifier for a session, minted by the initiating side and
/// carried on every envelope of that session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generates a fresh session identifier.
    pub fn new() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }

    /// Borrows the underlying identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        SessionId(id.to_string())
    }
}

/// Which side of the session this flow is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    /// Opened the session.
    Initiator,
    /// Was started in response to an open request.
    Responder,
}

/// Lifecycle state of a session endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Messages may be sent and received.
    Open,
    /// Closed cleanly by either side; no further traffic is accepted.
    Closed,
    /// Declared dead after the retransmission budget ran out. The owning
    /// flow sees this as a session failure event.
    Broken,
}

/// Control or data frame exchanged between two session endpoints.
///
/// Data frames carry a per-session sequence number starting at 1. The open
/// handshake frame uses sequence 0; acknowledgements are cumulative and
/// carry the highest contiguously received data sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Session this frame belongs to.
    pub session_id: SessionId,
    /// Position in the session's send order. 0 for the open frame.
    pub sequence: u64,
    /// What kind of frame this is.
    pub kind: EnvelopeKind,
    /// Application payload. Null for pure control frames.
    pub payload: Payload,
    /// Set when this frame is a retransmission. Receivers treat redelivered
    /// frames exactly like first deliveries; deduplication is by sequence.
    pub redelivered: bool,
}

/// Frame kinds on the session wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// First frame of a session. Names the flow type the responder node
    /// should start and the initiating party.
    Open {
        /// Responder flow type to start on the receiving node.
        flow_type: String,
        /// Party that opened the session.
        initiator: PartyName,
    },
    /// Ordered application message.
    Data,
    /// Cumulative acknowledgement of every data frame up to and including
    /// `through`.
    Ack {
        /// Highest contiguously received data sequence.
        through: u64,
    },
    /// Clean end of the session, ordered after all data frames.
    Close,
}

impl Envelope {
    /// Builds the session-open frame. Open is pure control; the first
    /// application message follows as an ordinary data frame.
    pub fn open(session_id: SessionId, flow_type: impl Into<String>, initiator: PartyName) -> Self {
        Envelope {
            session_id,
            sequence: 0,
            kind: EnvelopeKind::Open {
                flow_type: flow_type.into(),
                initiator,
            },
            payload: Payload::null(),
            redelivered: false,
        }
    }

    /// Builds a data frame at the given send sequence.
    pub fn data(session_id: SessionId, sequence: u64, payload: Payload) -> Self {
        Envelope {
            session_id,
            sequence,
            kind: EnvelopeKind::Data,
            payload,
            redelivered: false,
        }
    }

    /// Builds a cumulative acknowledgement frame.
    pub fn ack(session_id: SessionId, through: u64) -> Self {
        Envelope {
            session_id,
            sequence: 0,
            kind: EnvelopeKind::Ack { through },
            payload: Payload::null(),
            redelivered: false,
        }
    }

    /// Builds the close frame at the given send sequence.
    pub fn close(session_id: SessionId, sequence: u64) -> Self {
        Envelope {
            session_id,
            sequence,
            kind: EnvelopeKind::Close,
            payload: Payload::null(),
            redelivered: false,
        }
    }

    /// Marks this frame as a retransmission.
    pub fn redelivery(mut self) -> Self {
        self.redelivered = true;
        self
    }

    /// True for frames that occupy a slot in the ordered stream (data and
    /// close), as opposed to out-of-band control frames.
    pub fn is_sequenced(&self) -> bool {
        matches!(self.kind, EnvelopeKind::Data | EnvelopeKind::Close)
    }
}

/// Durable image of one session endpoint, embedded in the owning flow's
/// checkpoint.
///
/// `unacked` holds outbound sequenced frames the counterparty has not yet
/// acknowledged; recovery reloads them into the retransmission queue, which
/// is how sends stay at-least-once across a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session identifier.
    pub session_id: SessionId,
    /// The party on the other end.
    pub counterparty: PartyName,
    /// Which side of the session this endpoint is.
    pub role: SessionRole,
    /// Endpoint lifecycle state at checkpoint time.
    pub state: SessionState,
    /// Sequence the next outbound data or close frame will use.
    pub next_send_seq: u64,
    /// Lowest inbound data sequence not yet consumed by the flow.
    pub next_recv_seq: u64,
    /// Outbound frames not yet acknowledged: the open frame until the
    /// first ack arrives, then data and close frames.
    pub unacked: Vec<Envelope>,
}

impl SessionSnapshot {
    /// Snapshot of a freshly opened session endpoint.
    pub fn opened(session_id: SessionId, counterparty: PartyName, role: SessionRole) -> Self {
        SessionSnapshot {
            session_id,
            counterparty,
            role,
            state: SessionState::Open,
            next_send_seq: 1,
            next_recv_seq: 1,
            unacked: Vec::new(),
        }
    }

    /// Drops acknowledged frames up to and including `through`.
    pub fn acknowledge(&mut self, through: u64) {
        self.unacked.retain(|frame| frame.sequence > through);
    }
}
