//! The per-node session hub.
//!
//! The hub's live state is a cache over the durable truth held in flow
//! checkpoints. Outbound frames enter the hub through [`SessionHub::sync`],
//! which is called only after the checkpoint containing them is durable;
//! inbound frames are consumed the same way, by advancing the snapshot's
//! receive cursor and syncing. The hub itself only ever adds reliability
//! (retransmission, deduplication, reordering) on top of that durable
//! truth, so losing the hub's memory in a crash never loses a message.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ledgerflow_core::{
    CoreError, Envelope, EnvelopeKind, FlowId, PartyName, SessionId, SessionRole, SessionSnapshot,
    SessionState,
};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::events::SessionEvent;
use crate::transport::{InboundFrame, MessageTransport};

/// One node's session endpoints plus the reliability machinery around
/// them.
pub struct SessionHub {
    node: PartyName,
    config: SessionConfig,
    transport: Arc<dyn MessageTransport>,
    endpoints: DashMap<SessionId, Endpoint>,
    events: mpsc::Sender<SessionEvent>,
}

struct Endpoint {
    counterparty: PartyName,
    role: SessionRole,
    state: SessionState,
    owner: Option<FlowId>,
    next_send_seq: u64,
    next_recv_seq: u64,
    /// Highest cumulative ack received from the counterparty. `None`
    /// until the first ack, which is also what confirms the open frame.
    acked_through: Option<u64>,
    unacked: Vec<TrackedFrame>,
    inbound: BTreeMap<u64, Envelope>,
}

struct TrackedFrame {
    envelope: Envelope,
    attempts: u32,
    last_sent: Option<Instant>,
}

impl Endpoint {
    fn from_snapshot(snapshot: &SessionSnapshot) -> Self {
        Endpoint {
            counterparty: snapshot.counterparty.clone(),
            role: snapshot.role,
            state: SessionState::Open,
            owner: None,
            next_send_seq: snapshot.next_send_seq,
            next_recv_seq: snapshot.next_recv_seq,
            acked_through: None,
            unacked: Vec::new(),
            inbound: BTreeMap::new(),
        }
    }

    fn responder(counterparty: PartyName) -> Self {
        Endpoint {
            counterparty,
            role: SessionRole::Responder,
            state: SessionState::Open,
            owner: None,
            next_send_seq: 1,
            next_recv_seq: 1,
            acked_through: None,
            unacked: Vec::new(),
            inbound: BTreeMap::new(),
        }
    }

    fn covered(&self, sequence: u64) -> bool {
        self.acked_through.is_some_and(|through| sequence <= through)
    }

    fn tracks(&self, sequence: u64) -> bool {
        self.unacked
            .iter()
            .any(|t| t.envelope.sequence == sequence)
    }

    fn head(&self) -> Option<&Envelope> {
        self.inbound.get(&self.next_recv_seq)
    }
}

impl SessionHub {
    /// Creates a hub for `node`, emitting events into `events`.
    pub fn new(
        node: PartyName,
        config: SessionConfig,
        transport: Arc<dyn MessageTransport>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(SessionHub {
            node,
            config,
            transport,
            endpoints: DashMap::new(),
            events,
        })
    }

    /// The party this hub speaks for.
    pub fn node(&self) -> &PartyName {
        &self.node
    }

    /// Feeds inbound frames from a transport inbox into the hub.
    pub fn spawn_pump(self: &Arc<Self>, mut inbox: mpsc::Receiver<InboundFrame>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = inbox.recv().await {
                hub.handle_incoming(frame).await;
            }
            debug!(node = %hub.node, "session inbox closed");
        })
    }

    /// Periodically retransmits overdue frames and breaks sessions whose
    /// budget ran out.
    pub fn spawn_retransmit_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let tick = Duration::from_millis((hub.config.ack_timeout_ms / 2).max(5));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                hub.retransmit_pass().await;
            }
        })
    }

    /// Applies durable session snapshots after a successful checkpoint
    /// save: binds the owner, transmits frames the wire has not seen and
    /// acknowledges newly consumed inbound frames.
    pub async fn sync(&self, owner: &FlowId, snapshots: &[SessionSnapshot]) {
        self.sync_internal(owner, snapshots, false).await;
    }

    /// [`sync`](Self::sync) for recovery: every frame goes out flagged as
    /// a redelivery, because the original transmission may or may not have
    /// happened before the crash.
    pub async fn restore(&self, owner: &FlowId, snapshots: &[SessionSnapshot]) {
        self.sync_internal(owner, snapshots, true).await;
    }

    async fn sync_internal(&self, owner: &FlowId, snapshots: &[SessionSnapshot], redeliver: bool) {
        let mut outbound: Vec<(PartyName, Envelope)> = Vec::new();
        let mut events: Vec<SessionEvent> = Vec::new();
        let mut drop_endpoints: Vec<SessionId> = Vec::new();

        for snapshot in snapshots {
            let mut entry = self
                .endpoints
                .entry(snapshot.session_id.clone())
                .or_insert_with(|| Endpoint::from_snapshot(snapshot));
            let ep = entry.value_mut();
            ep.owner = Some(owner.clone());

            if snapshot.state == SessionState::Broken {
                // The flow has observed the breakage; nothing further
                // moves on this session.
                drop_endpoints.push(snapshot.session_id.clone());
                continue;
            }

            if snapshot.next_send_seq > ep.next_send_seq {
                ep.next_send_seq = snapshot.next_send_seq;
            }

            if snapshot.next_recv_seq > ep.next_recv_seq {
                let mut consumed_close = false;
                let drained: Vec<u64> = ep
                    .inbound
                    .range(..snapshot.next_recv_seq)
                    .map(|(seq, frame)| {
                        if matches!(frame.kind, EnvelopeKind::Close) {
                            consumed_close = true;
                        }
                        *seq
                    })
                    .collect();
                for seq in drained {
                    ep.inbound.remove(&seq);
                }
                ep.next_recv_seq = snapshot.next_recv_seq;
                if consumed_close {
                    ep.state = SessionState::Closed;
                }
                outbound.push((
                    ep.counterparty.clone(),
                    Envelope::ack(snapshot.session_id.clone(), ep.next_recv_seq - 1),
                ));
            }

            for frame in &snapshot.unacked {
                if ep.covered(frame.sequence) || ep.tracks(frame.sequence) {
                    continue;
                }
                let mut envelope = frame.clone();
                if redeliver {
                    envelope = envelope.redelivery();
                }
                ep.unacked.push(TrackedFrame {
                    envelope: envelope.clone(),
                    attempts: 1,
                    last_sent: Some(Instant::now()),
                });
                counter!("ledgerflow_session_frames_sent_total", 1);
                outbound.push((ep.counterparty.clone(), envelope));
            }

            // A close that is now at the head of the inbound stream is
            // ready for the flow to observe.
            if ep.state == SessionState::Open {
                if let Some(head) = ep.head() {
                    if matches!(head.kind, EnvelopeKind::Close) {
                        events.push(SessionEvent::PeerClosed {
                            session_id: snapshot.session_id.clone(),
                            owner: ep.owner.clone(),
                        });
                    }
                }
            }
        }

        for session_id in drop_endpoints {
            self.endpoints.remove(&session_id);
        }
        self.dispatch(outbound, events).await;
    }

    /// Binds a responder flow to a session created by an inbound open
    /// frame, returning the snapshot the responder's first checkpoint
    /// should embed.
    pub fn accept(
        &self,
        session_id: &SessionId,
        owner: &FlowId,
    ) -> Result<SessionSnapshot, CoreError> {
        let mut entry =
            self.endpoints
                .get_mut(session_id)
                .ok_or_else(|| CoreError::SessionFailure {
                    session_id: session_id.clone(),
                    reason: "unknown session".into(),
                })?;
        let ep = entry.value_mut();
        ep.owner = Some(owner.clone());
        Ok(SessionSnapshot {
            session_id: session_id.clone(),
            counterparty: ep.counterparty.clone(),
            role: ep.role,
            state: ep.state,
            next_send_seq: ep.next_send_seq,
            next_recv_seq: ep.next_recv_seq,
            unacked: Vec::new(),
        })
    }

    /// Peeks the next in-order inbound frame without consuming it.
    /// Repeated polls return the same frame until a sync advances the
    /// receive cursor past it.
    pub fn poll_delivery(&self, session_id: &SessionId) -> Option<Envelope> {
        self.endpoints
            .get(session_id)
            .and_then(|ep| ep.head().cloned())
    }

    /// Trims a snapshot against live acknowledgement state before it is
    /// persisted, so checkpoints do not carry frames the counterparty has
    /// already confirmed.
    pub fn reconcile(&self, snapshot: &mut SessionSnapshot) {
        if let Some(ep) = self.endpoints.get(&snapshot.session_id) {
            if let Some(through) = ep.acked_through {
                snapshot.acknowledge(through);
            }
        }
    }

    /// Current endpoint state, if the hub knows the session.
    pub fn session_state(&self, session_id: &SessionId) -> Option<SessionState> {
        self.endpoints.get(session_id).map(|ep| ep.state)
    }

    /// Drops every endpoint owned by a finished flow.
    pub fn release_owned(&self, owner: &FlowId) {
        self.endpoints
            .retain(|_, ep| ep.owner.as_ref() != Some(owner));
    }

    /// Processes one frame from the wire.
    pub async fn handle_incoming(&self, frame: InboundFrame) {
        let InboundFrame { from, envelope } = frame;
        let session_id = envelope.session_id.clone();
        let mut outbound: Vec<(PartyName, Envelope)> = Vec::new();
        let mut events: Vec<SessionEvent> = Vec::new();

        match envelope.kind.clone() {
            EnvelopeKind::Open { flow_type, .. } => {
                if let Some(ep) = self.endpoints.get(&session_id) {
                    // Duplicate open: confirm the session again.
                    outbound.push((
                        from,
                        Envelope::ack(session_id.clone(), ep.next_recv_seq - 1),
                    ));
                } else {
                    self.endpoints
                        .insert(session_id.clone(), Endpoint::responder(from.clone()));
                    outbound.push((from.clone(), Envelope::ack(session_id.clone(), 0)));
                    events.push(SessionEvent::OpenRequested {
                        session_id,
                        initiator: from,
                        flow_type,
                    });
                }
            }
            EnvelopeKind::Ack { through } => {
                if let Some(mut entry) = self.endpoints.get_mut(&session_id) {
                    let ep = entry.value_mut();
                    ep.acked_through = Some(ep.acked_through.map_or(through, |a| a.max(through)));
                    let close_acked = ep.unacked.iter().any(|t| {
                        matches!(t.envelope.kind, EnvelopeKind::Close)
                            && t.envelope.sequence <= through
                    });
                    ep.unacked.retain(|t| t.envelope.sequence > through);
                    if close_acked {
                        ep.state = SessionState::Closed;
                    }
                }
            }
            EnvelopeKind::Data => {
                self.handle_sequenced(&from, envelope, &mut outbound, &mut events);
            }
            EnvelopeKind::Close => {
                self.handle_sequenced(&from, envelope, &mut outbound, &mut events);
            }
        }

        self.dispatch(outbound, events).await;
    }

    fn handle_sequenced(
        &self,
        from: &PartyName,
        envelope: Envelope,
        outbound: &mut Vec<(PartyName, Envelope)>,
        events: &mut Vec<SessionEvent>,
    ) {
        let session_id = envelope.session_id.clone();
        let Some(mut entry) = self.endpoints.get_mut(&session_id) else {
            debug!(session = %session_id, "frame for unknown session dropped");
            return;
        };
        let ep = entry.value_mut();

        match ep.state {
            SessionState::Broken => return,
            SessionState::Closed => return,
            SessionState::Open => {}
        }

        if envelope.sequence < ep.next_recv_seq {
            // Already consumed: the ack must have been lost. Re-ack.
            counter!("ledgerflow_session_duplicates_dropped_total", 1);
            outbound.push((
                from.clone(),
                Envelope::ack(session_id, ep.next_recv_seq - 1),
            ));
            return;
        }

        if ep.inbound.len() >= self.config.receive_buffer
            && !ep.inbound.contains_key(&envelope.sequence)
        {
            warn!(session = %session_id, sequence = envelope.sequence,
                "receive buffer full, leaving frame to retransmission");
            return;
        }

        let is_close = matches!(envelope.kind, EnvelopeKind::Close);
        ep.inbound.entry(envelope.sequence).or_insert(envelope);

        if let Some(head) = ep.head() {
            let event = if matches!(head.kind, EnvelopeKind::Close) {
                SessionEvent::PeerClosed {
                    session_id,
                    owner: ep.owner.clone(),
                }
            } else {
                SessionEvent::Delivered {
                    session_id,
                    owner: ep.owner.clone(),
                }
            };
            events.push(event);
        } else if is_close {
            debug!("close buffered behind unconsumed data");
        }
    }

    /// One pass over every endpoint: retransmit overdue frames, break
    /// sessions that exhausted their budget. Public so tests can force a
    /// pass instead of sleeping.
    pub async fn retransmit_pass(&self) {
        let now = Instant::now();
        let timeout = Duration::from_millis(self.config.ack_timeout_ms);
        let mut outbound: Vec<(PartyName, Envelope)> = Vec::new();
        let mut events: Vec<SessionEvent> = Vec::new();

        for mut entry in self.endpoints.iter_mut() {
            let session_id = entry.key().clone();
            let ep = entry.value_mut();
            if ep.state != SessionState::Open {
                continue;
            }

            let mut exhausted = false;
            for tracked in &mut ep.unacked {
                let due = tracked
                    .last_sent
                    .map_or(true, |sent| now.duration_since(sent) >= timeout);
                if !due {
                    continue;
                }
                if tracked.attempts > self.config.max_retransmits {
                    exhausted = true;
                    break;
                }
                tracked.attempts += 1;
                tracked.last_sent = Some(now);
                let mut envelope = tracked.envelope.clone();
                if tracked.attempts > 1 {
                    envelope = envelope.redelivery();
                }
                counter!("ledgerflow_session_retransmits_total", 1);
                outbound.push((ep.counterparty.clone(), envelope));
            }

            if exhausted {
                counter!("ledgerflow_session_broken_total", 1);
                warn!(session = %session_id, counterparty = %ep.counterparty,
                    "retransmission budget exhausted, breaking session");
                ep.state = SessionState::Broken;
                ep.unacked.clear();
                events.push(SessionEvent::Broken {
                    session_id,
                    owner: ep.owner.clone(),
                    reason: format!(
                        "no acknowledgement after {} retransmissions",
                        self.config.max_retransmits
                    ),
                });
            }
        }

        self.dispatch(outbound, events).await;
    }

    async fn dispatch(&self, outbound: Vec<(PartyName, Envelope)>, events: Vec<SessionEvent>) {
        for (to, envelope) in outbound {
            if let Err(err) = self.transport.deliver(&self.node, &to, envelope).await {
                // The frame stays unacked; the retransmit loop tries again.
                debug!(%to, error = %err, "frame transmission failed");
            }
        }
        for event in events {
            if self.events.send(event).await.is_err() {
                debug!(node = %self.node, "session event receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcessTransport;
    use ledgerflow_core::Payload;
    use serde_json::json;

    struct Rig {
        hub: Arc<SessionHub>,
        events: mpsc::Receiver<SessionEvent>,
        transport: Arc<InProcessTransport>,
        peer_inbox: mpsc::Receiver<InboundFrame>,
    }

    /// One hub for "A", with "B" registered as a bare inbox so tests can
    /// play the counterparty by hand.
    fn rig() -> Rig {
        let transport = Arc::new(InProcessTransport::new());
        let _ = transport.register(PartyName::new("A"));
        let peer_inbox = transport.register(PartyName::new("B"));
        let (tx, rx) = mpsc::channel(64);
        let hub = SessionHub::new(
            PartyName::new("A"),
            SessionConfig::fast(),
            transport.clone() as Arc<dyn MessageTransport>,
            tx,
        );
        Rig {
            hub,
            events: rx,
            transport,
            peer_inbox,
        }
    }

    fn inbound(envelope: Envelope) -> InboundFrame {
        InboundFrame {
            from: PartyName::new("B"),
            envelope,
        }
    }

    fn snapshot_with_frames(session: &SessionId, frames: Vec<Envelope>) -> SessionSnapshot {
        let mut snap = SessionSnapshot::opened(
            session.clone(),
            PartyName::new("B"),
            SessionRole::Initiator,
        );
        snap.next_send_seq = frames
            .iter()
            .map(|f| f.sequence + 1)
            .max()
            .unwrap_or(1)
            .max(1);
        snap.unacked = frames;
        snap
    }

    #[tokio::test]
    async fn inbound_open_creates_endpoint_and_raises_event() {
        let mut rig = rig();
        let session = SessionId::new();

        rig.hub
            .handle_incoming(inbound(Envelope::open(
                session.clone(),
                "transfer/accept",
                PartyName::new("B"),
            )))
            .await;

        match rig.events.recv().await.unwrap() {
            SessionEvent::OpenRequested {
                session_id,
                initiator,
                flow_type,
            } => {
                assert_eq!(session_id, session);
                assert_eq!(initiator, PartyName::new("B"));
                assert_eq!(flow_type, "transfer/accept");
            }
            other => panic!("unexpected event {other:?}"),
        }

        // The open is confirmed with a cumulative ack through 0.
        let confirm = rig.peer_inbox.recv().await.unwrap();
        assert!(matches!(confirm.envelope.kind, EnvelopeKind::Ack { through: 0 }));
        assert_eq!(rig.hub.session_state(&session), Some(SessionState::Open));
    }

    #[tokio::test]
    async fn duplicate_open_is_reconfirmed_not_reannounced() {
        let mut rig = rig();
        let session = SessionId::new();
        let open = Envelope::open(session.clone(), "transfer/accept", PartyName::new("B"));

        rig.hub.handle_incoming(inbound(open.clone())).await;
        rig.hub.handle_incoming(inbound(open)).await;

        assert!(matches!(
            rig.events.recv().await.unwrap(),
            SessionEvent::OpenRequested { .. }
        ));
        // No second open event.
        assert!(rig.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn out_of_order_frames_are_held_until_the_gap_fills() {
        let mut rig = rig();
        let session = SessionId::new();
        rig.hub
            .handle_incoming(inbound(Envelope::open(
                session.clone(),
                "t",
                PartyName::new("B"),
            )))
            .await;
        let _ = rig.events.recv().await; // open event

        rig.hub
            .handle_incoming(inbound(Envelope::data(
                session.clone(),
                2,
                Payload::new(json!("p2")),
            )))
            .await;
        assert!(rig.hub.poll_delivery(&session).is_none());
        assert!(rig.events.try_recv().is_err());

        rig.hub
            .handle_incoming(inbound(Envelope::data(
                session.clone(),
                1,
                Payload::new(json!("p1")),
            )))
            .await;

        assert!(matches!(
            rig.events.recv().await.unwrap(),
            SessionEvent::Delivered { .. }
        ));
        let head = rig.hub.poll_delivery(&session).unwrap();
        assert_eq!(head.sequence, 1);
        assert_eq!(head.payload.as_str(), Some("p1"));
    }

    #[tokio::test]
    async fn poll_is_a_peek_and_sync_consumes() {
        let mut rig = rig();
        let session = SessionId::new();
        rig.hub
            .handle_incoming(inbound(Envelope::open(
                session.clone(),
                "t",
                PartyName::new("B"),
            )))
            .await;
        let _ = rig.events.recv().await;
        rig.hub
            .handle_incoming(inbound(Envelope::data(
                session.clone(),
                1,
                Payload::new(json!("p1")),
            )))
            .await;

        assert_eq!(rig.hub.poll_delivery(&session).unwrap().sequence, 1);
        assert_eq!(rig.hub.poll_delivery(&session).unwrap().sequence, 1);

        // Consume by syncing a snapshot whose cursor moved past frame 1.
        let owner = FlowId::new();
        let snapshot = rig.hub.accept(&session, &owner).unwrap();
        let mut consumed = snapshot.clone();
        consumed.next_recv_seq = 2;
        rig.hub.sync(&owner, &[consumed]).await;

        assert!(rig.hub.poll_delivery(&session).is_none());
    }

    #[tokio::test]
    async fn already_consumed_frame_is_dropped_and_reacked() {
        let mut rig = rig();
        let session = SessionId::new();
        rig.hub
            .handle_incoming(inbound(Envelope::open(
                session.clone(),
                "t",
                PartyName::new("B"),
            )))
            .await;
        let _ = rig.events.recv().await;
        let _ = rig.peer_inbox.recv().await; // ack(0) for the open

        rig.hub
            .handle_incoming(inbound(Envelope::data(
                session.clone(),
                1,
                Payload::new(json!("p1")),
            )))
            .await;
        let _ = rig.events.recv().await; // delivered wakeup
        let owner = FlowId::new();
        let mut snap = rig.hub.accept(&session, &owner).unwrap();
        snap.next_recv_seq = 2;
        rig.hub.sync(&owner, &[snap]).await;
        let _ = rig.peer_inbox.recv().await; // ack(1) from the sync

        // Redelivery of the consumed frame: no new event, but a fresh ack.
        rig.hub
            .handle_incoming(inbound(
                Envelope::data(session.clone(), 1, Payload::new(json!("p1"))).redelivery(),
            ))
            .await;
        assert!(rig.events.try_recv().is_err());
        let reack = rig.peer_inbox.recv().await.unwrap();
        assert!(matches!(reack.envelope.kind, EnvelopeKind::Ack { through: 1 }));
    }

    #[tokio::test]
    async fn sync_transmits_each_staged_frame_once() {
        let mut rig = rig();
        let session = SessionId::new();
        let owner = FlowId::new();

        let frames = vec![
            Envelope::open(session.clone(), "transfer/accept", PartyName::new("A")),
            Envelope::data(session.clone(), 1, Payload::new(json!("p1"))),
        ];
        let snap = snapshot_with_frames(&session, frames);

        rig.hub.sync(&owner, &[snap.clone()]).await;
        rig.hub.sync(&owner, &[snap]).await; // second sync with same snapshot

        let first = rig.peer_inbox.recv().await.unwrap();
        assert!(matches!(first.envelope.kind, EnvelopeKind::Open { .. }));
        let second = rig.peer_inbox.recv().await.unwrap();
        assert!(matches!(second.envelope.kind, EnvelopeKind::Data));
        // No retransmission from the duplicate sync.
        assert!(rig.peer_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn ack_trims_tracked_frames_and_reconcile_trims_snapshots() {
        let mut rig = rig();
        let session = SessionId::new();
        let owner = FlowId::new();
        let mut snap = snapshot_with_frames(
            &session,
            vec![
                Envelope::open(session.clone(), "t", PartyName::new("A")),
                Envelope::data(session.clone(), 1, Payload::new(json!("p1"))),
                Envelope::data(session.clone(), 2, Payload::new(json!("p2"))),
            ],
        );
        rig.hub.sync(&owner, &[snap.clone()]).await;

        rig.hub
            .handle_incoming(inbound(Envelope::ack(session.clone(), 1)))
            .await;

        rig.hub.reconcile(&mut snap);
        assert_eq!(snap.unacked.len(), 1);
        assert_eq!(snap.unacked[0].sequence, 2);

        // A later retransmit pass resends only the unacked frame.
        drop(rig.peer_inbox);
        tokio::time::sleep(Duration::from_millis(60)).await;
        rig.hub.retransmit_pass().await;
    }

    #[tokio::test]
    async fn retransmission_exhaustion_breaks_the_session() {
        let mut rig = rig();
        let session = SessionId::new();
        let owner = FlowId::new();
        let snap = snapshot_with_frames(
            &session,
            vec![Envelope::data(session.clone(), 1, Payload::new(json!("p1")))],
        );

        // B never acks.
        rig.transport.disconnect(&PartyName::new("B"));
        rig.hub.sync(&owner, &[snap]).await;

        for _ in 0..=SessionConfig::fast().max_retransmits + 1 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            rig.hub.retransmit_pass().await;
        }

        match rig.events.recv().await.unwrap() {
            SessionEvent::Broken {
                session_id, reason, ..
            } => {
                assert_eq!(session_id, session);
                assert!(reason.contains("retransmissions"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(rig.hub.session_state(&session), Some(SessionState::Broken));
    }

    #[tokio::test]
    async fn peer_close_surfaces_after_data_is_consumed() {
        let mut rig = rig();
        let session = SessionId::new();
        rig.hub
            .handle_incoming(inbound(Envelope::open(
                session.clone(),
                "t",
                PartyName::new("B"),
            )))
            .await;
        let _ = rig.events.recv().await;

        rig.hub
            .handle_incoming(inbound(Envelope::data(
                session.clone(),
                1,
                Payload::new(json!("last")),
            )))
            .await;
        rig.hub
            .handle_incoming(inbound(Envelope::close(session.clone(), 2)))
            .await;

        // Data first.
        assert!(matches!(
            rig.events.recv().await.unwrap(),
            SessionEvent::Delivered { .. }
        ));
        assert_eq!(rig.hub.poll_delivery(&session).unwrap().sequence, 1);

        // Consuming the data brings the close to the head.
        let owner = FlowId::new();
        let mut snap = rig.hub.accept(&session, &owner).unwrap();
        snap.next_recv_seq = 2;
        rig.hub.sync(&owner, &[snap.clone()]).await;
        match rig.events.recv().await.unwrap() {
            SessionEvent::PeerClosed { session_id, .. } => assert_eq!(session_id, session),
            other => panic!("unexpected event {other:?}"),
        }

        // Consuming the close marks the endpoint closed.
        snap.next_recv_seq = 3;
        rig.hub.sync(&owner, &[snap]).await;
        assert_eq!(rig.hub.session_state(&session), Some(SessionState::Closed));
    }

    #[tokio::test]
    async fn release_owned_drops_only_that_flows_endpoints() {
        let rig = rig();
        let owner_a = FlowId::new();
        let owner_b = FlowId::new();
        let s1 = SessionId::new();
        let s2 = SessionId::new();

        rig.hub
            .sync(&owner_a, &[snapshot_with_frames(&s1, vec![])])
            .await;
        rig.hub
            .sync(&owner_b, &[snapshot_with_frames(&s2, vec![])])
            .await;

        rig.hub.release_owned(&owner_a);
        assert!(rig.hub.session_state(&s1).is_none());
        assert!(rig.hub.session_state(&s2).is_some());
    }
}
