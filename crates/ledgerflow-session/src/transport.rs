//! Frame carrier abstraction and the in-process carrier.
//!
//! The hub does not care how frames move between nodes, only that a
//! carrier exists with at-least-once semantics: it may duplicate, reorder
//! or lose frames, and the hub's sequencing, acknowledgement and
//! retransmission machinery turns that into exactly-once consumption.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use ledgerflow_core::{CoreError, Envelope, EnvelopeKind, PartyName};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// A frame and who sent it, as handed to the receiving node.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Sending party.
    pub from: PartyName,
    /// The frame.
    pub envelope: Envelope,
}

/// Moves envelopes between nodes. At-least-once: implementations may
/// duplicate or drop frames, and delivery order is not guaranteed.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Hands a frame to the carrier for delivery to `to`.
    async fn deliver(
        &self,
        from: &PartyName,
        to: &PartyName,
        envelope: Envelope,
    ) -> Result<(), CoreError>;
}

/// Deliberate carrier misbehaviour, for reliability tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// Deliver the next data frame twice.
    DuplicateNextData,
    /// Silently lose the next data frame.
    DropNextData,
}

/// Carrier connecting the nodes of one process through channels.
///
/// Each node registers its party name and receives the inbox end; a pump
/// task feeds frames from the inbox into the node's hub. Tests can inject
/// duplication and loss, or disconnect a party wholesale.
pub struct InProcessTransport {
    inboxes: DashMap<PartyName, Inbox>,
    faults: Mutex<VecDeque<FaultMode>>,
}

struct Inbox {
    sender: mpsc::Sender<InboundFrame>,
    connected: bool,
}

const INBOX_CAPACITY: usize = 256;

impl InProcessTransport {
    /// Creates an empty carrier.
    pub fn new() -> Self {
        InProcessTransport {
            inboxes: DashMap::new(),
            faults: Mutex::new(VecDeque::new()),
        }
    }

    /// Registers a party and returns its inbox. Re-registering replaces
    /// the previous inbox, which models a node restart.
    pub fn register(&self, party: PartyName) -> mpsc::Receiver<InboundFrame> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.inboxes.insert(
            party,
            Inbox {
                sender: tx,
                connected: true,
            },
        );
        rx
    }

    /// Queues a fault to apply to an upcoming data frame. Faults apply in
    /// injection order, one frame each.
    pub async fn inject_fault(&self, fault: FaultMode) {
        self.faults.lock().await.push_back(fault);
    }

    /// Makes every delivery to `party` vanish until reconnected.
    pub fn disconnect(&self, party: &PartyName) {
        if let Some(mut inbox) = self.inboxes.get_mut(party) {
            inbox.connected = false;
        }
    }

    /// Restores delivery to a disconnected party.
    pub fn reconnect(&self, party: &PartyName) {
        if let Some(mut inbox) = self.inboxes.get_mut(party) {
            inbox.connected = true;
        }
    }

    async fn take_fault(&self, envelope: &Envelope) -> Option<FaultMode> {
        if !matches!(envelope.kind, EnvelopeKind::Data) {
            return None;
        }
        self.faults.lock().await.pop_front()
    }
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageTransport for InProcessTransport {
    async fn deliver(
        &self,
        from: &PartyName,
        to: &PartyName,
        envelope: Envelope,
    ) -> Result<(), CoreError> {
        let fault = self.take_fault(&envelope).await;

        let (sender, connected) = match self.inboxes.get(to) {
            Some(inbox) => (inbox.sender.clone(), inbox.connected),
            None => {
                return Err(CoreError::TransportError(format!(
                    "no route to party {to}"
                )))
            }
        };
        if !connected {
            debug!(%to, session = %envelope.session_id, "dropping frame for disconnected party");
            return Ok(());
        }

        let copies = match fault {
            Some(FaultMode::DropNextData) => {
                debug!(%to, sequence = envelope.sequence, "fault: dropping data frame");
                0
            }
            Some(FaultMode::DuplicateNextData) => {
                debug!(%to, sequence = envelope.sequence, "fault: duplicating data frame");
                2
            }
            None => 1,
        };

        for _ in 0..copies {
            let frame = InboundFrame {
                from: from.clone(),
                envelope: envelope.clone(),
            };
            if sender.send(frame).await.is_err() {
                warn!(%to, "inbox closed, frame lost");
                return Ok(());
            }
        }
        Ok(())
    }
}
