//! Reusable scenario flows.
//!
//! `ProposeFlow`/`AcceptFlow` drive a two-party settlement: propose an
//! amount over a session, collect the acceptance and notarise the spend
//! of an input state. `PingFlow`/`PongResponder` are the smallest
//! possible round trip for transport and scheduler smoke tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use ledgerflow_core::{
    CoreError, KeyId, NotarisationRequest, NotarisationResult, PartyName, PartySignature,
    Payload, SignedTransaction, StateRef, Suspension, TransactionPayload,
};
use ledgerflow_engine::{FlowContext, FlowEvent, FlowLogic, FlowScheduler, Transition};

/// Key every scenario node signs with.
pub const NODE_KEY_ID: &str = "node-key";

/// Wait bound for every scenario suspension point.
const STEP_TIMEOUT_MS: u64 = 5_000;

/// Parameters for [`ProposeFlow`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeParams {
    /// Counterparty asked to accept the settlement.
    pub counterparty: String,
    /// Amount to settle.
    pub amount: i64,
    /// State the settlement consumes.
    pub input: StateRef,
}

/// Initiator half of the settlement scenario.
///
/// Opens a session to the counterparty, proposes an amount, waits for
/// the acceptance, then notarises a transaction spending the input
/// state. Completes only on a committed verdict.
pub struct ProposeFlow;

#[async_trait]
impl FlowLogic for ProposeFlow {
    fn flow_type(&self) -> &str {
        "trade/propose"
    }

    async fn start(&self, ctx: &mut FlowContext) -> Result<Transition, CoreError> {
        let params: ProposeParams = ctx.params().parse()?;
        let counterparty = PartyName::new(params.counterparty.as_str());
        let session = ctx.open_session(&counterparty, "trade/accept");
        ctx.send(
            &session,
            Payload::new(json!({ "kind": "propose", "amount": params.amount })),
        )?;
        Ok(Transition::Suspend {
            state: json!({ "phase": "proposed", "params": params }),
            awaiting: Suspension::Receive {
                session_id: session,
                timeout_ms: Some(STEP_TIMEOUT_MS),
            },
        })
    }

    async fn resume(
        &self,
        state: Value,
        event: FlowEvent,
        ctx: &mut FlowContext,
    ) -> Result<Transition, CoreError> {
        match event {
            FlowEvent::MessageDelivered {
                session_id,
                payload,
            } => {
                let params: ProposeParams = serde_json::from_value(state["params"].clone())?;
                let reply = payload.as_value().clone();
                if reply["kind"] != json!("accept") || reply["amount"] != json!(params.amount) {
                    return Ok(Transition::Abort {
                        reason: format!("counterparty declined: {reply}"),
                    });
                }
                ctx.close_session(&session_id)?;

                let outputs = vec![Payload::new(json!({
                    "beneficiary": params.counterparty,
                    "amount": params.amount,
                }))];
                let tx =
                    SignedTransaction::new(TransactionPayload::new(vec![params.input], outputs))?;
                let key = KeyId::new(NODE_KEY_ID);
                let signature = ctx.sign(&key, tx.id.as_bytes()).await?;
                let tx =
                    tx.with_signature(PartySignature::new(ctx.party().clone(), key, signature));
                let request = NotarisationRequest::new(tx, ctx.party().clone());
                Ok(Transition::Suspend {
                    state: json!({ "phase": "notarising", "amount": params.amount }),
                    awaiting: Suspension::Notarise {
                        request,
                        timeout_ms: Some(STEP_TIMEOUT_MS),
                    },
                })
            }
            FlowEvent::NotaryResponse { result, .. } => match result {
                NotarisationResult::Committed { transaction_id, .. } => {
                    Ok(Transition::Complete {
                        result: json!({
                            "settled": state["amount"],
                            "transaction_id": transaction_id,
                        }),
                    })
                }
                conflict @ NotarisationResult::Conflict { .. } => {
                    Err(conflict.into_conflict_error().unwrap_or_else(|| {
                        CoreError::FlowLogicError("conflict verdict without conflicts".into())
                    }))
                }
                NotarisationResult::Error { message, .. } => Ok(Transition::Abort {
                    reason: format!("notary error: {message}"),
                }),
            },
            FlowEvent::TimedOut { .. } => Ok(Transition::Abort {
                reason: "counterparty did not answer in time".into(),
            }),
            FlowEvent::SessionBroken { reason, .. } => Ok(Transition::Abort {
                reason: format!("session failed: {reason}"),
            }),
            other => Ok(Transition::Abort {
                reason: format!("unexpected event {}", other.kind()),
            }),
        }
    }
}

/// Responder half of the settlement scenario: accepts whatever amount is
/// proposed, then waits for the initiator's close.
pub struct AcceptFlow;

#[async_trait]
impl FlowLogic for AcceptFlow {
    fn flow_type(&self) -> &str {
        "trade/accept"
    }

    async fn start(&self, ctx: &mut FlowContext) -> Result<Transition, CoreError> {
        let session = ctx
            .accepted_session()
            .ok_or_else(|| CoreError::FlowLogicError("no inbound session".into()))?;
        Ok(Transition::Suspend {
            state: json!({ "phase": "awaiting_proposal" }),
            awaiting: Suspension::Receive {
                session_id: session,
                timeout_ms: Some(STEP_TIMEOUT_MS),
            },
        })
    }

    async fn resume(
        &self,
        state: Value,
        event: FlowEvent,
        ctx: &mut FlowContext,
    ) -> Result<Transition, CoreError> {
        match event {
            FlowEvent::MessageDelivered {
                session_id,
                payload,
            } => {
                let amount = payload.as_value()["amount"].as_i64().unwrap_or_default();
                ctx.send(
                    &session_id,
                    Payload::new(json!({ "kind": "accept", "amount": amount })),
                )?;
                Ok(Transition::Suspend {
                    state: json!({ "phase": "awaiting_close", "amount": amount }),
                    awaiting: Suspension::Receive {
                        session_id,
                        timeout_ms: Some(STEP_TIMEOUT_MS),
                    },
                })
            }
            FlowEvent::SessionBroken { reason, .. } if reason.contains("closed") => {
                Ok(Transition::Complete {
                    result: json!({ "accepted": state["amount"] }),
                })
            }
            FlowEvent::TimedOut { .. } => Ok(Transition::Abort {
                reason: "initiator went quiet".into(),
            }),
            other => Ok(Transition::Abort {
                reason: format!("unexpected event {}", other.kind()),
            }),
        }
    }
}

/// Sends one ping and completes on the echoed pong.
pub struct PingFlow;

#[async_trait]
impl FlowLogic for PingFlow {
    fn flow_type(&self) -> &str {
        "diag/ping"
    }

    async fn start(&self, ctx: &mut FlowContext) -> Result<Transition, CoreError> {
        let params = ctx.params().as_value().clone();
        let counterparty = PartyName::new(params["counterparty"].as_str().unwrap_or_default());
        let nonce = params["nonce"].as_i64().unwrap_or(1);
        let session = ctx.open_session(&counterparty, "diag/pong");
        ctx.send(&session, Payload::new(json!({ "nonce": nonce })))?;
        Ok(Transition::Suspend {
            state: json!({ "nonce": nonce }),
            awaiting: Suspension::Receive {
                session_id: session,
                timeout_ms: Some(STEP_TIMEOUT_MS),
            },
        })
    }

    async fn resume(
        &self,
        _state: Value,
        event: FlowEvent,
        ctx: &mut FlowContext,
    ) -> Result<Transition, CoreError> {
        match event {
            FlowEvent::MessageDelivered {
                session_id,
                payload,
            } => {
                ctx.close_session(&session_id)?;
                Ok(Transition::Complete {
                    result: json!({ "pong": payload.into_value() }),
                })
            }
            other => Ok(Transition::Abort {
                reason: format!("unexpected event {}", other.kind()),
            }),
        }
    }
}

/// Echoes whatever arrives, then completes once the peer closes.
pub struct PongResponder;

#[async_trait]
impl FlowLogic for PongResponder {
    fn flow_type(&self) -> &str {
        "diag/pong"
    }

    async fn start(&self, ctx: &mut FlowContext) -> Result<Transition, CoreError> {
        let session = ctx
            .accepted_session()
            .ok_or_else(|| CoreError::FlowLogicError("no inbound session".into()))?;
        Ok(Transition::Suspend {
            state: json!({ "phase": "listening" }),
            awaiting: Suspension::Receive {
                session_id: session,
                timeout_ms: Some(STEP_TIMEOUT_MS),
            },
        })
    }

    async fn resume(
        &self,
        _state: Value,
        event: FlowEvent,
        ctx: &mut FlowContext,
    ) -> Result<Transition, CoreError> {
        match event {
            FlowEvent::MessageDelivered {
                session_id,
                payload,
            } => {
                ctx.send(&session_id, payload)?;
                Ok(Transition::Suspend {
                    state: json!({ "phase": "awaiting_close" }),
                    awaiting: Suspension::Receive {
                        session_id,
                        timeout_ms: Some(STEP_TIMEOUT_MS),
                    },
                })
            }
            FlowEvent::SessionBroken { reason, .. } if reason.contains("closed") => {
                Ok(Transition::Complete {
                    result: json!({ "done": true }),
                })
            }
            other => Ok(Transition::Abort {
                reason: format!("unexpected event {}", other.kind()),
            }),
        }
    }
}

/// Registers every scenario flow on a scheduler, responder halves
/// included, so session opens and recovery can find them.
pub fn register_scenario_flows(scheduler: &FlowScheduler) {
    scheduler.register(Arc::new(ProposeFlow));
    scheduler.register(Arc::new(AcceptFlow));
    scheduler.register(Arc::new(PingFlow));
    scheduler.register(Arc::new(PongResponder));
}
