//! Durable flow checkpoints.
//!
//! A checkpoint is the complete resumable image of a flow at one suspension
//! point: its serialized logic state, what it is waiting for, and the state
//! of every session it owns. Checkpoints for one flow form a monotonic
//! sequence; each write supersedes the previous image atomically, so a
//! crash between two suspension points always recovers to the older one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::flow::{FlowId, FlowStatus, Suspension};
use crate::domain::session::SessionSnapshot;
use crate::error::CoreError;

/// One durable image of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Flow this image belongs to.
    pub flow_id: FlowId,
    /// Position in the flow's checkpoint sequence, starting at 0. Each
    /// successor must carry exactly the predecessor's sequence plus one.
    pub sequence: u64,
    /// Registered name of the flow logic, used to rebuild it on recovery.
    pub flow_type: String,
    /// Lifecycle state at the time of the write. Never `Running`.
    pub status: FlowStatus,
    /// Serialized flow logic state; the flow result once completed.
    pub state: Value,
    /// What the flow is waiting for, when suspended.
    pub awaiting: Option<Suspension>,
    /// Every session the flow owns, with enough detail to resume traffic.
    pub sessions: Vec<SessionSnapshot>,
    /// Most recent failure reason, for retrying, hospitalized and failed
    /// images.
    pub failure: Option<String>,
    /// Consecutive failed attempts at the current step.
    pub retries: u32,
    /// When this image was produced.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// The first checkpoint of a flow, written before its first step runs.
    pub fn initial(flow_id: FlowId, flow_type: impl Into<String>, state: Value) -> Self {
        Checkpoint {
            flow_id,
            sequence: 0,
            flow_type: flow_type.into(),
            status: FlowStatus::Created,
            state,
            awaiting: None,
            sessions: Vec::new(),
            failure: None,
            retries: 0,
            created_at: Utc::now(),
        }
    }

    /// Successor image parked at a suspension point. Resets the retry
    /// counter: reaching a new suspension point means the step succeeded.
    pub fn suspend(
        &self,
        state: Value,
        awaiting: Suspension,
        sessions: Vec<SessionSnapshot>,
    ) -> Result<Checkpoint, CoreError> {
        let mut next = self.successor(FlowStatus::Suspended)?;
        next.state = state;
        next.awaiting = Some(awaiting);
        next.sessions = sessions;
        Ok(next)
    }

    /// Terminal successor carrying the flow's result.
    pub fn complete(
        &self,
        result: Value,
        sessions: Vec<SessionSnapshot>,
    ) -> Result<Checkpoint, CoreError> {
        let mut next = self.successor(FlowStatus::Completed)?;
        next.state = result;
        next.sessions = sessions;
        Ok(next)
    }

    /// Terminal successor for a definitive failure or cancellation.
    pub fn fail(&self, reason: impl Into<String>) -> Result<Checkpoint, CoreError> {
        let mut next = self.successor(FlowStatus::Failed)?;
        next.failure = Some(reason.into());
        next.retries = self.retries;
        Ok(next)
    }

    /// Successor recording a failed attempt at the current step. Keeps the
    /// resumable image (state, suspension, sessions) of its predecessor so
    /// the step can be re-run from it.
    pub fn retry(&self, reason: impl Into<String>) -> Result<Checkpoint, CoreError> {
        let mut next = self.successor(FlowStatus::Retrying)?;
        next.awaiting = self.awaiting.clone();
        next.failure = Some(reason.into());
        next.retries = self.retries + 1;
        Ok(next)
    }

    /// Successor parking the flow for operator attention. Only reachable
    /// after at least one recorded retry. Keeps the resumable image so an
    /// operator retry can pick up where the flow left off.
    pub fn hospitalize(&self, reason: impl Into<String>) -> Result<Checkpoint, CoreError> {
        let mut next = self.successor(FlowStatus::Hospitalized)?;
        next.awaiting = self.awaiting.clone();
        next.failure = Some(reason.into());
        next.retries = self.retries;
        Ok(next)
    }

    /// Successor returning a hospitalized flow to the retry path after an
    /// operator intervention.
    pub fn release_for_retry(&self) -> Result<Checkpoint, CoreError> {
        let mut next = self.successor(FlowStatus::Retrying)?;
        next.awaiting = self.awaiting.clone();
        next.failure = self.failure.clone();
        next.retries = 0;
        Ok(next)
    }

    /// True once the flow can make no further progress.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Condensed view for listings.
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            flow_id: self.flow_id.clone(),
            sequence: self.sequence,
            flow_type: self.flow_type.clone(),
            status: self.status,
            awaiting: self.awaiting.as_ref().map(|s| s.kind().to_string()),
            failure: self.failure.clone(),
            retries: self.retries,
            created_at: self.created_at,
        }
    }

    fn successor(&self, status: FlowStatus) -> Result<Checkpoint, CoreError> {
        if !may_follow(self.status, status) {
            return Err(CoreError::InvalidState(format!(
                "flow {} cannot move from {} to {}",
                self.flow_id, self.status, status
            )));
        }
        Ok(Checkpoint {
            flow_id: self.flow_id.clone(),
            sequence: self.sequence + 1,
            flow_type: self.flow_type.clone(),
            status,
            state: self.state.clone(),
            awaiting: None,
            sessions: self.sessions.clone(),
            failure: None,
            retries: 0,
            created_at: Utc::now(),
        })
    }
}

/// Which persisted statuses may follow which. `Created` and `Running` are
/// never written as successors; execution between two checkpoints is
/// implicit.
fn may_follow(current: FlowStatus, next: FlowStatus) -> bool {
    use FlowStatus::*;
    if current.is_terminal() {
        return false;
    }
    match next {
        Created | Running => false,
        Hospitalized => current == Retrying,
        Retrying => true,
        Suspended | Completed | Failed => current != Hospitalized || next == Failed,
    }
}

/// Condensed checkpoint view returned by store listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    /// Flow identifier.
    pub flow_id: FlowId,
    /// Latest persisted sequence.
    pub sequence: u64,
    /// Registered flow logic name.
    pub flow_type: String,
    /// Persisted lifecycle state.
    pub status: FlowStatus,
    /// Suspension kind, when suspended.
    pub awaiting: Option<String>,
    /// Most recent failure reason, if any.
    pub failure: Option<String>,
    /// Consecutive failed attempts at the current step.
    pub retries: u32,
    /// When the latest image was produced.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::Suspension;
    use crate::domain::session::SessionId;
    use serde_json::json;

    fn initial() -> Checkpoint {
        Checkpoint::initial(FlowId::new(), "transfer/propose", json!({"step": "init"}))
    }

    fn receive() -> Suspension {
        Suspension::Receive {
            session_id: SessionId::new(),
            timeout_ms: None,
        }
    }

    #[test]
    fn initial_checkpoint_starts_the_sequence() {
        let cp = initial();
        assert_eq!(cp.sequence, 0);
        assert_eq!(cp.status, FlowStatus::Created);
        assert!(cp.awaiting.is_none());
        assert!(!cp.is_terminal());
    }

    #[test]
    fn suspend_advances_sequence_and_records_wait() {
        let cp = initial();
        let next = cp
            .suspend(json!({"step": "awaiting-reply"}), receive(), vec![])
            .unwrap();
        assert_eq!(next.sequence, 1);
        assert_eq!(next.status, FlowStatus::Suspended);
        assert_eq!(next.awaiting.as_ref().map(|s| s.kind()), Some("receive"));
    }

    #[test]
    fn suspend_resets_retry_bookkeeping() {
        let cp = initial();
        let retrying = cp.retry("step blew up").unwrap();
        assert_eq!(retrying.retries, 1);
        assert_eq!(retrying.failure.as_deref(), Some("step blew up"));

        let recovered = retrying
            .suspend(json!({"step": "awaiting-reply"}), receive(), vec![])
            .unwrap();
        assert_eq!(recovered.retries, 0);
        assert!(recovered.failure.is_none());
    }

    #[test]
    fn retry_preserves_the_resumable_image() {
        let cp = initial()
            .suspend(json!({"step": "awaiting-reply"}), receive(), vec![])
            .unwrap();
        let retrying = cp.retry("delivery handler failed").unwrap();
        assert_eq!(retrying.state, cp.state);
        assert_eq!(retrying.sessions, cp.sessions);
        assert_eq!(retrying.awaiting, cp.awaiting);
        assert_eq!(retrying.retries, 1);
    }

    #[test]
    fn consecutive_retries_accumulate() {
        let cp = initial();
        let once = cp.retry("boom").unwrap();
        let twice = once.retry("boom again").unwrap();
        assert_eq!(twice.retries, 2);
        assert_eq!(twice.sequence, 2);
    }

    #[test]
    fn hospitalize_requires_a_recorded_retry() {
        let cp = initial();
        assert!(cp.hospitalize("no retry yet").is_err());

        let retrying = cp.retry("boom").unwrap();
        let parked = retrying.hospitalize("retry budget exhausted").unwrap();
        assert_eq!(parked.status, FlowStatus::Hospitalized);
        assert_eq!(parked.retries, 1);
    }

    #[test]
    fn hospitalized_flow_only_moves_to_retry_or_failed() {
        let parked = initial()
            .retry("boom")
            .unwrap()
            .hospitalize("exhausted")
            .unwrap();

        assert!(parked.suspend(json!({}), receive(), vec![]).is_err());
        assert!(parked.complete(json!(null), vec![]).is_err());

        let released = parked.release_for_retry().unwrap();
        assert_eq!(released.status, FlowStatus::Retrying);
        assert_eq!(released.retries, 0);

        let cancelled = parked.fail("cancelled by operator").unwrap();
        assert_eq!(cancelled.status, FlowStatus::Failed);
    }

    #[test]
    fn terminal_checkpoints_admit_no_successor() {
        let done = initial().complete(json!({"result": 1}), vec![]).unwrap();
        assert!(done.is_terminal());
        assert!(done.suspend(json!({}), receive(), vec![]).is_err());
        assert!(done.fail("too late").is_err());
        assert!(done.retry("too late").is_err());
    }

    #[test]
    fn summary_reflects_the_image() {
        let cp = initial()
            .suspend(json!({"step": "waiting"}), receive(), vec![])
            .unwrap();
        let summary = cp.summary();
        assert_eq!(summary.flow_id, cp.flow_id);
        assert_eq!(summary.sequence, 1);
        assert_eq!(summary.status, FlowStatus::Suspended);
        assert_eq!(summary.awaiting.as_deref(), Some("receive"));
    }

    #[test]
    fn checkpoint_round_trips_through_json() {
        let cp = initial()
            .suspend(json!({"step": "waiting", "n": 3}), receive(), vec![])
            .unwrap();
        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(cp, back);
    }
}
