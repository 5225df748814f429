//! The API a running step uses to stage its effects.
//!
//! Nothing a step does through its context touches the wire directly.
//! Opened sessions, outbound messages and closes accumulate on working
//! session snapshots; only after the checkpoint embedding those
//! snapshots is durable does the scheduler hand them to the session hub
//! for transmission. A step that fails, or a node that crashes
//! mid-step, leaves no partial effects behind.

use std::sync::Arc;

use ledgerflow_core::{
    AuthorizationHook, CoreError, Envelope, FlowAction, FlowId, KeyId, PartyName, Payload,
    SessionId, SessionRole, SessionSnapshot, SessionState, SigningService,
};
use ledgerflow_session::SessionHub;

/// Step-scoped view of a flow: identity, start parameters, the working
/// session set, and passthroughs to the signing service and the
/// authorization hook.
pub struct FlowContext {
    flow_id: FlowId,
    flow_type: String,
    party: PartyName,
    params: Payload,
    sessions: Vec<SessionSnapshot>,
    hub: Arc<SessionHub>,
    signer: Arc<dyn SigningService>,
    authorizer: Arc<dyn AuthorizationHook>,
}

impl FlowContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        flow_id: FlowId,
        flow_type: String,
        party: PartyName,
        params: Payload,
        sessions: Vec<SessionSnapshot>,
        hub: Arc<SessionHub>,
        signer: Arc<dyn SigningService>,
        authorizer: Arc<dyn AuthorizationHook>,
    ) -> Self {
        FlowContext {
            flow_id,
            flow_type,
            party,
            params,
            sessions,
            hub,
            signer,
            authorizer,
        }
    }

    /// The flow this step belongs to.
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Registered type of the running flow.
    pub fn flow_type(&self) -> &str {
        &self.flow_type
    }

    /// The party this node acts as.
    pub fn party(&self) -> &PartyName {
        &self.party
    }

    /// Parameters the flow was started with. Null for responder flows.
    pub fn params(&self) -> &Payload {
        &self.params
    }

    /// Opens a session to `counterparty`, asking its node to start
    /// `responder_type` on the other end. The open frame goes out once
    /// the next checkpoint is durable.
    pub fn open_session(&mut self, counterparty: &PartyName, responder_type: &str) -> SessionId {
        let session_id = SessionId::new();
        let mut snapshot = SessionSnapshot::opened(
            session_id.clone(),
            counterparty.clone(),
            SessionRole::Initiator,
        );
        snapshot.unacked.push(Envelope::open(
            session_id.clone(),
            responder_type,
            self.party.clone(),
        ));
        self.sessions.push(snapshot);
        session_id
    }

    /// The session this responder flow was started for, if any.
    pub fn accepted_session(&self) -> Option<SessionId> {
        self.sessions
            .iter()
            .find(|snapshot| snapshot.role == SessionRole::Responder)
            .map(|snapshot| snapshot.session_id.clone())
    }

    /// Identifiers of every session the flow currently owns.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .map(|snapshot| snapshot.session_id.clone())
            .collect()
    }

    /// Stages `payload` as the next ordered message on a session.
    pub fn send(&mut self, session_id: &SessionId, payload: Payload) -> Result<(), CoreError> {
        if self.hub.session_state(session_id) == Some(SessionState::Broken) {
            return Err(CoreError::SessionFailure {
                session_id: session_id.clone(),
                reason: "session is broken".into(),
            });
        }
        let snapshot = self.snapshot_mut(session_id)?;
        if snapshot.state != SessionState::Open {
            return Err(CoreError::SessionFailure {
                session_id: session_id.clone(),
                reason: "session is closed".into(),
            });
        }
        let sequence = snapshot.next_send_seq;
        snapshot
            .unacked
            .push(Envelope::data(session_id.clone(), sequence, payload));
        snapshot.next_send_seq = sequence + 1;
        Ok(())
    }

    /// Stages the clean end of a session, ordered after every message
    /// sent on it. Closing an already closed session is a no-op.
    pub fn close_session(&mut self, session_id: &SessionId) -> Result<(), CoreError> {
        let snapshot = self.snapshot_mut(session_id)?;
        if snapshot.state != SessionState::Open {
            return Ok(());
        }
        let sequence = snapshot.next_send_seq;
        snapshot
            .unacked
            .push(Envelope::close(session_id.clone(), sequence));
        snapshot.next_send_seq = sequence + 1;
        snapshot.state = SessionState::Closed;
        Ok(())
    }

    /// Signs `message` with a key held by the node's signing backend.
    pub async fn sign(&self, key_id: &KeyId, message: &[u8]) -> Result<Vec<u8>, CoreError> {
        self.signer
            .sign(key_id, message)
            .await
            .map_err(|err| CoreError::SigningFailure(err.to_string()))
    }

    /// Asks the node's authorization hook to clear an action. A veto is
    /// definitive and fails the flow.
    pub fn authorize(&self, action: &FlowAction) -> Result<(), CoreError> {
        self.authorizer.authorize(action)
    }

    /// Marks inbound frames up to (excluding) `next_recv_seq` as
    /// consumed by this step.
    pub(crate) fn consume(&mut self, session_id: &SessionId, next_recv_seq: u64) {
        if let Ok(snapshot) = self.snapshot_mut(session_id) {
            if next_recv_seq > snapshot.next_recv_seq {
                snapshot.next_recv_seq = next_recv_seq;
            }
        }
    }

    /// Overrides the recorded lifecycle state of a session.
    pub(crate) fn mark_session(&mut self, session_id: &SessionId, state: SessionState) {
        if let Ok(snapshot) = self.snapshot_mut(session_id) {
            snapshot.state = state;
        }
    }

    /// Consumes the context, reconciling each working snapshot against
    /// the hub so already-acknowledged frames are not persisted.
    pub(crate) fn into_sessions(mut self) -> Vec<SessionSnapshot> {
        let hub = Arc::clone(&self.hub);
        for snapshot in &mut self.sessions {
            hub.reconcile(snapshot);
        }
        self.sessions
    }

    fn snapshot_mut(&mut self, session_id: &SessionId) -> Result<&mut SessionSnapshot, CoreError> {
        self.sessions
            .iter_mut()
            .find(|snapshot| &snapshot.session_id == session_id)
            .ok_or_else(|| CoreError::SessionFailure {
                session_id: session_id.clone(),
                reason: "session does not belong to this flow".into(),
            })
    }
}
