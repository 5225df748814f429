//! The flow scheduler: runs steps, persists checkpoints, and releases
//! staged effects only after the image they belong to is durable.
//!
//! Every resident flow has a gate holding its step mutex, so at most one
//! step of a flow runs at a time; a semaphore bounds how many flows step
//! concurrently. A step is driven by a wakeup (redrive, delivery, notary
//! verdict, timer, cancellation), reloads the latest checkpoint, runs
//! the registered logic, and commits the outcome as a successor image.
//! Side effects (session frames, notarisation submissions, timers) are
//! released strictly after the commit, which keeps a crash at any point
//! equivalent to re-running the step from its checkpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ledgerflow_core::{
    AuthorizationHook, Checkpoint, CheckpointStore, CheckpointSummary, CoreError, EnvelopeKind,
    FailureClass, FlowId, FlowStatus, NotarisationRequest, NotarisationResult, NotaryClient,
    PartyName, Payload, SessionId, SessionState, SigningService, Suspension,
};
use ledgerflow_session::{SessionEvent, SessionHub};
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::FlowContext;
use crate::logic::{FlowEvent, FlowLogic, Transition};
use crate::registry::FlowRegistry;

/// Attempts at persisting one checkpoint before the step is abandoned
/// and re-driven later.
const SAVE_ATTEMPTS: u32 = 3;

const WAKEUP_CAPACITY: usize = 1024;

/// What prods a flow into running its next step. Timer and notary
/// wakeups carry the checkpoint sequence they were armed against, so a
/// wakeup that outlived its suspension is recognised and dropped.
#[derive(Debug)]
enum Wakeup {
    /// Drive the flow from its persisted image: run a first step, re-arm
    /// a suspension, or re-run a failed step.
    Redrive,
    /// A session has its next in-order frame ready.
    Delivered { session_id: SessionId },
    /// A session died.
    Broken { session_id: SessionId, reason: String },
    /// The notary call submitted at `sequence` finished.
    Notary {
        sequence: u64,
        outcome: Result<NotarisationResult, CoreError>,
    },
    /// The timer armed at `sequence` elapsed.
    Timer { sequence: u64 },
    /// Operator cancellation; the request itself travels on the gate.
    Cancel,
}

/// Per-resident-flow state. Presence in the gate map is what marks a
/// flow as resident on this scheduler: wakeups for flows without a gate
/// are stale and dropped.
struct FlowGate {
    step: tokio::sync::Mutex<()>,
    cancel: AtomicBool,
}

impl FlowGate {
    fn new() -> Arc<Self> {
        Arc::new(FlowGate {
            step: tokio::sync::Mutex::new(()),
            cancel: AtomicBool::new(false),
        })
    }
}

/// Outcome of a checkpoint commit attempt.
enum Persisted {
    Saved,
    /// Another writer appended the same successor first. This scheduler
    /// no longer owns the flow.
    LostOwnership,
    /// The store stayed unavailable through every attempt.
    Unavailable(String),
}

/// Runs flows for one node: owns the step pipeline, the retry and
/// hospitalization policy, operator controls, and crash recovery.
pub struct FlowScheduler {
    party: PartyName,
    owner: String,
    config: EngineConfig,
    store: Arc<dyn CheckpointStore>,
    hub: Arc<SessionHub>,
    notary: Arc<dyn NotaryClient>,
    signer: Arc<dyn SigningService>,
    authorizer: Arc<dyn AuthorizationHook>,
    registry: FlowRegistry,
    gates: DashMap<FlowId, Arc<FlowGate>>,
    workers: Arc<Semaphore>,
    wakeups: mpsc::Sender<(FlowId, Wakeup)>,
    inbox: Mutex<Option<mpsc::Receiver<(FlowId, Wakeup)>>>,
}

impl FlowScheduler {
    /// Builds a scheduler. Call [`spawn_wakeup_pump`](Self::spawn_wakeup_pump),
    /// [`spawn_session_pump`](Self::spawn_session_pump) and
    /// [`spawn_lease_renewal`](Self::spawn_lease_renewal) to bring it live.
    pub fn new(
        party: PartyName,
        config: EngineConfig,
        store: Arc<dyn CheckpointStore>,
        hub: Arc<SessionHub>,
        notary: Arc<dyn NotaryClient>,
        signer: Arc<dyn SigningService>,
        authorizer: Arc<dyn AuthorizationHook>,
    ) -> Arc<Self> {
        let (wakeups, inbox) = mpsc::channel(WAKEUP_CAPACITY);
        let workers = Arc::new(Semaphore::new(config.worker_permits));
        Arc::new(FlowScheduler {
            owner: party.to_string(),
            party,
            config,
            store,
            hub,
            notary,
            signer,
            authorizer,
            registry: FlowRegistry::new(),
            gates: DashMap::new(),
            workers,
            wakeups,
            inbox: Mutex::new(Some(inbox)),
        })
    }

    /// The party this scheduler runs flows as.
    pub fn party(&self) -> &PartyName {
        &self.party
    }

    /// Registers flow logic so responder opens and recovery can find it.
    pub fn register(&self, logic: Arc<dyn FlowLogic>) {
        self.registry.register(logic);
    }

    /// Starts a new flow and returns its identifier. The initial
    /// checkpoint is durable before this returns; the first step runs
    /// asynchronously.
    pub async fn start(
        &self,
        logic: Arc<dyn FlowLogic>,
        params: Payload,
    ) -> Result<FlowId, CoreError> {
        self.registry.register(Arc::clone(&logic));
        let flow_id = FlowId::new();
        if !self
            .store
            .acquire_lease(&flow_id, &self.owner, self.config.lease_ttl())
            .await?
        {
            return Err(CoreError::AlreadyRunning(flow_id));
        }
        let checkpoint = Checkpoint::initial(flow_id.clone(), logic.flow_type(), params.into_value());
        self.store.save(&checkpoint).await?;
        self.ensure_gate(&flow_id);
        counter!("ledgerflow_flows_started_total", 1);
        info!(flow = %flow_id, flow_type = logic.flow_type(), "flow started");
        self.deliver(flow_id.clone(), Wakeup::Redrive).await;
        Ok(flow_id)
    }

    /// Latest persisted image of a flow, if any.
    pub async fn status(&self, flow_id: &FlowId) -> Result<Option<CheckpointSummary>, CoreError> {
        Ok(self.store.load(flow_id).await?.map(|cp| cp.summary()))
    }

    /// Requests cooperative cancellation of a suspended or hospitalized
    /// flow. The flow's logic sees [`FlowEvent::CancellationRequested`]
    /// and may finish its own way; a hospitalized flow is failed
    /// directly.
    pub async fn cancel(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        let checkpoint = self
            .store
            .load(flow_id)
            .await?
            .ok_or_else(|| CoreError::FlowNotFound(flow_id.clone()))?;
        match checkpoint.status {
            FlowStatus::Suspended | FlowStatus::Hospitalized => {}
            other => {
                return Err(CoreError::InvalidState(format!(
                    "flow {flow_id} cannot be cancelled while {other}"
                )))
            }
        }
        if !self.gates.contains_key(flow_id)
            && !self
                .store
                .acquire_lease(flow_id, &self.owner, self.config.lease_ttl())
                .await?
        {
            return Err(CoreError::AlreadyRunning(flow_id.clone()));
        }
        let gate = self.ensure_gate(flow_id);
        gate.cancel.store(true, Ordering::Relaxed);
        info!(flow = %flow_id, "cancellation requested");
        self.deliver(flow_id.clone(), Wakeup::Cancel).await;
        Ok(())
    }

    /// Returns a hospitalized flow to the retry path after an operator
    /// intervention. The retry counter starts over.
    pub async fn retry_hospitalized(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        let checkpoint = self
            .store
            .load(flow_id)
            .await?
            .ok_or_else(|| CoreError::FlowNotFound(flow_id.clone()))?;
        if checkpoint.status != FlowStatus::Hospitalized {
            return Err(CoreError::InvalidState(format!(
                "flow {flow_id} is not hospitalized"
            )));
        }
        if !self
            .store
            .acquire_lease(flow_id, &self.owner, self.config.lease_ttl())
            .await?
        {
            return Err(CoreError::AlreadyRunning(flow_id.clone()));
        }
        let released = checkpoint.release_for_retry()?;
        self.store.save(&released).await?;
        self.ensure_gate(flow_id);
        self.hub.restore(flow_id, &released.sessions).await;
        info!(flow = %flow_id, "hospitalized flow released for retry");
        self.deliver(flow_id.clone(), Wakeup::Redrive).await;
        Ok(())
    }

    /// Flows currently parked for operator attention, with the failure
    /// that parked them.
    pub async fn hospitalized(&self) -> Result<Vec<(FlowId, String)>, CoreError> {
        Ok(self
            .store
            .list(Some(FlowStatus::Hospitalized))
            .await?
            .into_iter()
            .map(|summary| {
                let reason = summary.failure.unwrap_or_default();
                (summary.flow_id, reason)
            })
            .collect())
    }

    /// Deletes the checkpoint of a terminal flow and forgets its
    /// sessions. The store rejects deletion of live flows.
    pub async fn delete_checkpoint(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        self.store.delete(flow_id).await?;
        self.hub.release_owned(flow_id);
        self.release_flow(flow_id).await;
        Ok(())
    }

    /// Adopts every non-terminal, non-hospitalized flow in the store
    /// that no other scheduler holds a live lease on: reloads its
    /// checkpoint, restores its session endpoints and retransmission
    /// queue, and re-arms its suspension. Returns how many flows were
    /// adopted.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, CoreError> {
        let summaries = self.store.list(None).await?;
        let mut recovered = 0usize;
        for summary in summaries {
            if summary.status.is_terminal() || summary.status == FlowStatus::Hospitalized {
                continue;
            }
            if !self
                .store
                .acquire_lease(&summary.flow_id, &self.owner, self.config.lease_ttl())
                .await?
            {
                debug!(flow = %summary.flow_id, "flow leased elsewhere, skipping");
                continue;
            }
            let Some(checkpoint) = self.store.load(&summary.flow_id).await? else {
                continue;
            };
            self.ensure_gate(&checkpoint.flow_id);
            self.hub.restore(&checkpoint.flow_id, &checkpoint.sessions).await;
            info!(
                flow = %checkpoint.flow_id,
                status = %checkpoint.status,
                sequence = checkpoint.sequence,
                "flow recovered"
            );
            self.deliver(checkpoint.flow_id.clone(), Wakeup::Redrive).await;
            recovered += 1;
        }
        if recovered > 0 {
            info!(count = recovered, "recovery complete");
        }
        Ok(recovered)
    }

    /// Consumes queued wakeups and fans each out to a step task.
    pub fn spawn_wakeup_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let Some(mut inbox) = self.inbox.lock().take() else {
            warn!("wakeup pump already running");
            return tokio::spawn(async {});
        };
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((flow_id, wakeup)) = inbox.recv().await {
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    scheduler.run_step(flow_id, wakeup).await;
                });
            }
            debug!("wakeup queue closed");
        })
    }

    /// Consumes session events from the hub: starts responder flows for
    /// inbound opens and converts the rest into flow wakeups.
    pub fn spawn_session_pump(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<SessionEvent>,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                scheduler.handle_session_event(event).await;
            }
            debug!(node = %scheduler.party, "session event channel closed");
        })
    }

    /// Renews the activation lease of every resident flow at half the
    /// lease lifetime.
    pub fn spawn_lease_renewal(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let period = Duration::from_millis((scheduler.config.lease_ttl_ms / 2).max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let resident: Vec<FlowId> =
                    scheduler.gates.iter().map(|entry| entry.key().clone()).collect();
                for flow_id in resident {
                    match scheduler
                        .store
                        .acquire_lease(&flow_id, &scheduler.owner, scheduler.config.lease_ttl())
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(flow = %flow_id, "activation lease lost to another owner")
                        }
                        Err(err) => warn!(flow = %flow_id, error = %err, "lease renewal failed"),
                    }
                }
            }
        })
    }

    /// Waits until no step holds a worker permit. Stop the wakeup pump
    /// first, or new steps keep the drain from ever finishing.
    pub async fn quiesce(&self) {
        if let Ok(all) = self
            .workers
            .acquire_many(self.config.worker_permits as u32)
            .await
        {
            drop(all);
        }
    }

    async fn handle_session_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::OpenRequested {
                session_id,
                initiator,
                flow_type,
            } => {
                if let Err(err) = self.start_responder(&session_id, &initiator, &flow_type).await {
                    warn!(
                        session = %session_id,
                        flow_type,
                        error = %err,
                        "responder flow start failed"
                    );
                }
            }
            SessionEvent::Delivered { session_id, owner }
            | SessionEvent::PeerClosed { session_id, owner } => {
                if let Some(owner) = owner {
                    self.deliver(owner, Wakeup::Delivered { session_id }).await;
                } else {
                    debug!(session = %session_id, "delivery for unbound session deferred");
                }
            }
            SessionEvent::Broken {
                session_id,
                owner,
                reason,
            } => {
                if let Some(owner) = owner {
                    self.deliver(owner, Wakeup::Broken { session_id, reason }).await;
                }
            }
        }
    }

    /// Starts the responder flow named by an inbound session open and
    /// binds the session to it.
    async fn start_responder(
        &self,
        session_id: &SessionId,
        initiator: &PartyName,
        flow_type: &str,
    ) -> Result<(), CoreError> {
        let logic = self.registry.get(flow_type)?;
        let flow_id = FlowId::new();
        if !self
            .store
            .acquire_lease(&flow_id, &self.owner, self.config.lease_ttl())
            .await?
        {
            return Err(CoreError::AlreadyRunning(flow_id));
        }
        let snapshot = self.hub.accept(session_id, &flow_id)?;
        let mut checkpoint = Checkpoint::initial(flow_id.clone(), logic.flow_type(), Value::Null);
        checkpoint.sessions = vec![snapshot];
        self.store.save(&checkpoint).await?;
        self.ensure_gate(&flow_id);
        counter!("ledgerflow_flows_started_total", 1);
        info!(
            flow = %flow_id,
            flow_type,
            initiator = %initiator,
            session = %session_id,
            "responder flow started"
        );
        self.deliver(flow_id.clone(), Wakeup::Redrive).await;
        Ok(())
    }

    async fn deliver(&self, flow_id: FlowId, wakeup: Wakeup) {
        if self.wakeups.send((flow_id, wakeup)).await.is_err() {
            debug!("wakeup queue closed, wakeup dropped");
        }
    }

    /// One step of one flow: serialized per flow by the gate, bounded
    /// across flows by the worker semaphore.
    async fn run_step(self: Arc<Self>, flow_id: FlowId, wakeup: Wakeup) {
        let Some(gate) = self.gates.get(&flow_id).map(|entry| Arc::clone(entry.value())) else {
            debug!(flow = %flow_id, "wakeup for non-resident flow dropped");
            return;
        };
        let _step = gate.step.lock().await;
        let _permit = match self.workers.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        if let Err(err) = self.step(&flow_id, wakeup, &gate).await {
            warn!(flow = %flow_id, error = %err, "flow step abandoned");
        }
    }

    async fn step(
        self: &Arc<Self>,
        flow_id: &FlowId,
        wakeup: Wakeup,
        gate: &FlowGate,
    ) -> Result<(), CoreError> {
        let Some(checkpoint) = self.store.load(flow_id).await? else {
            debug!(flow = %flow_id, "wakeup for unknown flow dropped");
            return Ok(());
        };
        if checkpoint.is_terminal() {
            return Ok(());
        }

        // A pending cancellation takes effect at the flow's suspension
        // point. Retry images sit at the same suspension point as the
        // image they retry, so they honour it too.
        if gate.cancel.load(Ordering::Relaxed)
            && matches!(
                checkpoint.status,
                FlowStatus::Suspended | FlowStatus::Retrying | FlowStatus::Hospitalized
            )
        {
            gate.cancel.store(false, Ordering::Relaxed);
            return self.cancel_flow(checkpoint).await;
        }

        match checkpoint.status {
            FlowStatus::Created => self.run_start(checkpoint).await,
            FlowStatus::Suspended | FlowStatus::Retrying => self.drive(checkpoint, wakeup).await,
            // Hospitalized flows move only through operator calls.
            FlowStatus::Hospitalized => Ok(()),
            FlowStatus::Running | FlowStatus::Completed | FlowStatus::Failed => Ok(()),
        }
    }

    /// Routes a wakeup against the flow's current suspension. Wakeups
    /// that no longer match (stale timers, frames for a session the flow
    /// is not awaiting) are dropped; the arming pass re-checks every
    /// source, so nothing is lost.
    async fn drive(
        self: &Arc<Self>,
        checkpoint: Checkpoint,
        wakeup: Wakeup,
    ) -> Result<(), CoreError> {
        match wakeup {
            Wakeup::Redrive => {
                if checkpoint.awaiting.is_none() {
                    // A retry image of a failed first step.
                    return self.run_start(checkpoint).await;
                }
                self.arm(&checkpoint).await;
                Ok(())
            }
            Wakeup::Delivered { session_id } => {
                if !awaiting_receive_on(&checkpoint, &session_id) {
                    return Ok(());
                }
                let Some(frame) = self.hub.poll_delivery(&session_id) else {
                    return Ok(());
                };
                let mut ctx = self.context(&checkpoint);
                ctx.consume(&session_id, frame.sequence + 1);
                let event = if matches!(frame.kind, EnvelopeKind::Close) {
                    ctx.mark_session(&session_id, SessionState::Closed);
                    FlowEvent::SessionBroken {
                        session_id,
                        reason: "session closed by counterparty".into(),
                    }
                } else {
                    FlowEvent::MessageDelivered {
                        session_id,
                        payload: frame.payload,
                    }
                };
                self.resume(checkpoint, event, ctx).await
            }
            Wakeup::Broken { session_id, reason } => {
                if !awaiting_receive_on(&checkpoint, &session_id) {
                    return Ok(());
                }
                let mut ctx = self.context(&checkpoint);
                ctx.mark_session(&session_id, SessionState::Broken);
                self.resume(
                    checkpoint,
                    FlowEvent::SessionBroken { session_id, reason },
                    ctx,
                )
                .await
            }
            Wakeup::Notary { sequence, outcome } => {
                if sequence != checkpoint.sequence {
                    return Ok(());
                }
                let Some(Suspension::Notarise { request, .. }) = &checkpoint.awaiting else {
                    return Ok(());
                };
                let transaction_id = request.transaction_id();
                match outcome {
                    Ok(result) if result.is_definitive() => {
                        let ctx = self.context(&checkpoint);
                        self.resume(
                            checkpoint,
                            FlowEvent::NotaryResponse {
                                transaction_id,
                                result,
                            },
                            ctx,
                        )
                        .await
                    }
                    Ok(result) => {
                        let reason = match &result {
                            NotarisationResult::Error { message, .. } => {
                                format!("notary unavailable: {message}")
                            }
                            _ => "notary unavailable".to_string(),
                        };
                        self.fault(checkpoint, reason).await
                    }
                    Err(err) if err.is_retriable() => {
                        self.fault(checkpoint, format!("notarisation failed: {err}")).await
                    }
                    Err(err) => {
                        self.fail_flow(checkpoint, format!("notarisation failed: {err}")).await
                    }
                }
            }
            Wakeup::Timer { sequence } => {
                if sequence != checkpoint.sequence {
                    return Ok(());
                }
                let Some(awaiting) = checkpoint.awaiting.clone() else {
                    return Ok(());
                };
                let event = match &awaiting {
                    Suspension::Timer { .. } => FlowEvent::TimerFired,
                    Suspension::Receive { .. } | Suspension::Notarise { .. } => {
                        FlowEvent::TimedOut { awaiting: awaiting.clone() }
                    }
                };
                let ctx = self.context(&checkpoint);
                self.resume(checkpoint, event, ctx).await
            }
            // The request travels on the gate flag; the wakeup only
            // forces a step.
            Wakeup::Cancel => Ok(()),
        }
    }

    async fn run_start(self: &Arc<Self>, checkpoint: Checkpoint) -> Result<(), CoreError> {
        let logic = match self.registry.get(&checkpoint.flow_type) {
            Ok(logic) => logic,
            Err(err) => {
                // Leave the flow parked; a restart with the type
                // registered recovers it.
                warn!(flow = %checkpoint.flow_id, error = %err, "flow left parked");
                return Ok(());
            }
        };
        debug!(flow = %checkpoint.flow_id, flow_type = %checkpoint.flow_type, "running first step");
        let mut ctx = self.context(&checkpoint);
        let outcome = logic.start(&mut ctx).await;
        self.settle(checkpoint, outcome, ctx).await
    }

    async fn resume(
        self: &Arc<Self>,
        checkpoint: Checkpoint,
        event: FlowEvent,
        mut ctx: FlowContext,
    ) -> Result<(), CoreError> {
        let logic = match self.registry.get(&checkpoint.flow_type) {
            Ok(logic) => logic,
            Err(err) => {
                warn!(flow = %checkpoint.flow_id, error = %err, "flow left parked");
                return Ok(());
            }
        };
        debug!(
            flow = %checkpoint.flow_id,
            sequence = checkpoint.sequence,
            event = event.kind(),
            "resuming flow"
        );
        let outcome = logic.resume(checkpoint.state.clone(), event, &mut ctx).await;
        self.settle(checkpoint, outcome, ctx).await
    }

    /// Commits a step outcome: builds the successor image, persists it,
    /// and only then releases staged frames and arms the suspension.
    async fn settle(
        self: &Arc<Self>,
        checkpoint: Checkpoint,
        outcome: Result<Transition, CoreError>,
        ctx: FlowContext,
    ) -> Result<(), CoreError> {
        match outcome {
            Ok(Transition::Suspend { state, awaiting }) => {
                let next = checkpoint.suspend(state, awaiting, ctx.into_sessions())?;
                match self.persist(&next).await? {
                    Persisted::Saved => {
                        self.hub.sync(&next.flow_id, &next.sessions).await;
                        self.arm(&next).await;
                        Ok(())
                    }
                    Persisted::LostOwnership => self.stand_down(&next.flow_id).await,
                    Persisted::Unavailable(reason) => self.redrive_later(&checkpoint, reason).await,
                }
            }
            Ok(Transition::Complete { result }) => {
                let next = checkpoint.complete(result, ctx.into_sessions())?;
                match self.persist(&next).await? {
                    Persisted::Saved => {
                        counter!("ledgerflow_flows_completed_total", 1);
                        info!(flow = %next.flow_id, "flow completed");
                        // Keep endpoints live so close frames can
                        // retransmit until acknowledged.
                        self.hub.sync(&next.flow_id, &next.sessions).await;
                        if self.config.delete_completed {
                            if let Err(err) = self.store.delete(&next.flow_id).await {
                                warn!(flow = %next.flow_id, error = %err, "completed checkpoint not deleted");
                            }
                        }
                        self.release_flow(&next.flow_id).await;
                        Ok(())
                    }
                    Persisted::LostOwnership => self.stand_down(&next.flow_id).await,
                    Persisted::Unavailable(reason) => self.redrive_later(&checkpoint, reason).await,
                }
            }
            Ok(Transition::Abort { reason }) => self.fail_flow(checkpoint, reason).await,
            Err(err) => match err.classify() {
                FailureClass::Transient | FailureClass::Logic => {
                    self.fault(checkpoint, err.to_string()).await
                }
                // A session failure surfaced as an error, rather than
                // handled as an event, is definitive for the flow.
                FailureClass::Session | FailureClass::Definitive => {
                    self.fail_flow(checkpoint, err.to_string()).await
                }
            },
        }
    }

    /// Records a retriable step failure: a retry image within budget, a
    /// hospitalized image once the budget is spent.
    async fn fault(self: &Arc<Self>, checkpoint: Checkpoint, reason: String) -> Result<(), CoreError> {
        if checkpoint.status == FlowStatus::Retrying && checkpoint.retries >= self.config.retry_budget
        {
            counter!("ledgerflow_flows_hospitalized_total", 1);
            warn!(
                flow = %checkpoint.flow_id,
                retries = checkpoint.retries,
                reason = %reason,
                "retry budget exhausted, hospitalizing flow"
            );
            let parked = checkpoint.hospitalize(reason)?;
            match self.persist(&parked).await? {
                Persisted::Saved => {
                    self.release_flow(&parked.flow_id).await;
                    Ok(())
                }
                Persisted::LostOwnership => self.stand_down(&parked.flow_id).await,
                Persisted::Unavailable(why) => self.redrive_later(&checkpoint, why).await,
            }
        } else {
            counter!("ledgerflow_steps_retried_total", 1);
            let retrying = checkpoint.retry(reason)?;
            match self.persist(&retrying).await? {
                Persisted::Saved => {
                    let delay = self.config.backoff(retrying.retries);
                    debug!(
                        flow = %retrying.flow_id,
                        retries = retrying.retries,
                        delay_ms = delay.as_millis() as u64,
                        "step failed, retry scheduled"
                    );
                    self.redrive_after(retrying.flow_id.clone(), delay);
                    Ok(())
                }
                Persisted::LostOwnership => self.stand_down(&retrying.flow_id).await,
                Persisted::Unavailable(why) => self.redrive_later(&checkpoint, why).await,
            }
        }
    }

    /// Commits a definitive failure and tears the flow down.
    async fn fail_flow(
        self: &Arc<Self>,
        checkpoint: Checkpoint,
        reason: String,
    ) -> Result<(), CoreError> {
        let next = checkpoint.fail(reason.clone())?;
        match self.persist(&next).await? {
            Persisted::Saved => {
                counter!("ledgerflow_flows_failed_total", 1);
                warn!(flow = %next.flow_id, reason = %reason, "flow failed");
                self.hub.release_owned(&next.flow_id);
                self.release_flow(&next.flow_id).await;
                Ok(())
            }
            Persisted::LostOwnership => self.stand_down(&next.flow_id).await,
            Persisted::Unavailable(why) => self.redrive_later(&checkpoint, why).await,
        }
    }

    /// Cooperative cancellation at a suspension point. Suspended and
    /// retrying flows get one final step; hospitalized flows are failed
    /// directly.
    async fn cancel_flow(self: &Arc<Self>, checkpoint: Checkpoint) -> Result<(), CoreError> {
        if matches!(
            checkpoint.status,
            FlowStatus::Suspended | FlowStatus::Retrying
        ) && checkpoint.awaiting.is_some()
        {
            if let Ok(logic) = self.registry.get(&checkpoint.flow_type) {
                let mut ctx = self.context(&checkpoint);
                let outcome = logic
                    .resume(
                        checkpoint.state.clone(),
                        FlowEvent::CancellationRequested,
                        &mut ctx,
                    )
                    .await;
                return match outcome {
                    Ok(Transition::Complete { result }) => {
                        self.settle(checkpoint, Ok(Transition::Complete { result }), ctx).await
                    }
                    Ok(Transition::Abort { reason }) => self.fail_flow(checkpoint, reason).await,
                    // Suspending through a cancellation is not allowed.
                    Ok(Transition::Suspend { .. }) | Err(_) => {
                        self.fail_flow(checkpoint, "cancelled by operator".into()).await
                    }
                };
            }
        }
        self.fail_flow(checkpoint, "cancelled by operator".into()).await
    }

    /// Arms the wakeup sources for a suspended image: timers, the
    /// notarisation submission, and a recheck of already-buffered or
    /// already-dead sessions so no event from before the commit is lost.
    async fn arm(self: &Arc<Self>, checkpoint: &Checkpoint) {
        let Some(awaiting) = &checkpoint.awaiting else {
            return;
        };
        let flow_id = checkpoint.flow_id.clone();
        match awaiting {
            Suspension::Timer { duration_ms } => {
                self.arm_timer(flow_id, checkpoint.sequence, *duration_ms);
            }
            Suspension::Receive {
                session_id,
                timeout_ms,
            } => {
                if let Some(timeout) = timeout_ms {
                    self.arm_timer(flow_id.clone(), checkpoint.sequence, *timeout);
                }
                if self.hub.session_state(session_id) == Some(SessionState::Broken) {
                    self.deliver(
                        flow_id,
                        Wakeup::Broken {
                            session_id: session_id.clone(),
                            reason: "session is broken".into(),
                        },
                    )
                    .await;
                } else if self.hub.poll_delivery(session_id).is_some() {
                    self.deliver(
                        flow_id,
                        Wakeup::Delivered {
                            session_id: session_id.clone(),
                        },
                    )
                    .await;
                }
            }
            Suspension::Notarise {
                request,
                timeout_ms,
            } => {
                if let Some(timeout) = timeout_ms {
                    self.arm_timer(flow_id.clone(), checkpoint.sequence, *timeout);
                }
                self.submit_notarisation(flow_id, checkpoint.sequence, request.clone());
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, flow_id: FlowId, sequence: u64, delay_ms: u64) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            scheduler.deliver(flow_id, Wakeup::Timer { sequence }).await;
        });
    }

    /// Submits the notarisation request off the step path. Submission
    /// after the checkpoint is durable plus an idempotent notary makes
    /// resubmission on recovery safe.
    fn submit_notarisation(self: &Arc<Self>, flow_id: FlowId, sequence: u64, request: NotarisationRequest) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            debug!(
                flow = %flow_id,
                transaction = %request.transaction_id(),
                "submitting notarisation request"
            );
            let outcome = scheduler.notary.notarise(&request).await;
            scheduler.deliver(flow_id, Wakeup::Notary { sequence, outcome }).await;
        });
    }

    /// Persists a successor image, riding out transient store failures.
    async fn persist(&self, checkpoint: &Checkpoint) -> Result<Persisted, CoreError> {
        let mut attempt = 0u32;
        loop {
            match self.store.save(checkpoint).await {
                Ok(()) => return Ok(Persisted::Saved),
                Err(CoreError::StaleCheckpoint {
                    flow_id,
                    attempted,
                    latest,
                }) => {
                    debug!(
                        flow = %flow_id,
                        attempted,
                        latest,
                        "checkpoint write lost the sequence race"
                    );
                    return Ok(Persisted::LostOwnership);
                }
                Err(err) if err.classify() == FailureClass::Transient => {
                    attempt += 1;
                    if attempt >= SAVE_ATTEMPTS {
                        return Ok(Persisted::Unavailable(err.to_string()));
                    }
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The step could not be committed; the flow stays at its prior
    /// checkpoint and is re-driven once the store has had a moment.
    async fn redrive_later(
        self: &Arc<Self>,
        checkpoint: &Checkpoint,
        reason: String,
    ) -> Result<(), CoreError> {
        warn!(
            flow = %checkpoint.flow_id,
            reason = %reason,
            "checkpoint store unavailable, step abandoned for later redrive"
        );
        self.redrive_after(checkpoint.flow_id.clone(), self.config.backoff(1));
        Ok(())
    }

    fn redrive_after(self: &Arc<Self>, flow_id: FlowId, delay: Duration) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.deliver(flow_id, Wakeup::Redrive).await;
        });
    }

    /// Another writer owns the flow's checkpoint chain now; drop all
    /// local claims on it.
    async fn stand_down(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        warn!(flow = %flow_id, "checkpoint superseded by another writer, standing down");
        self.release_flow(flow_id).await;
        Ok(())
    }

    async fn release_flow(&self, flow_id: &FlowId) {
        self.gates.remove(flow_id);
        if let Err(err) = self.store.release_lease(flow_id, &self.owner).await {
            warn!(flow = %flow_id, error = %err, "lease release failed");
        }
    }

    fn context(&self, checkpoint: &Checkpoint) -> FlowContext {
        FlowContext::new(
            checkpoint.flow_id.clone(),
            checkpoint.flow_type.clone(),
            self.party.clone(),
            Payload::new(checkpoint.state.clone()),
            checkpoint.sessions.clone(),
            Arc::clone(&self.hub),
            Arc::clone(&self.signer),
            Arc::clone(&self.authorizer),
        )
    }

    fn ensure_gate(&self, flow_id: &FlowId) -> Arc<FlowGate> {
        Arc::clone(
            self.gates
                .entry(flow_id.clone())
                .or_insert_with(FlowGate::new)
                .value(),
        )
    }
}

fn awaiting_receive_on(checkpoint: &Checkpoint, session_id: &SessionId) -> bool {
    matches!(
        &checkpoint.awaiting,
        Some(Suspension::Receive { session_id: awaited, .. }) if awaited == session_id
    )
}
