//! Retry decorator for notary clients.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ledgerflow_core::{
    CoreError, FailureClass, NotarisationRequest, NotarisationResult, NotaryClient,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Bounded exponential backoff for notarisation attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry. Doubles on each further retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Ceiling for the doubling delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Millisecond-scale backoff for tests.
    pub fn fast() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
        }
    }
}

/// Wraps a [`NotaryClient`] and retries outcomes that do not settle the
/// request: carrier faults and `Unavailable` verdicts. Committed,
/// conflict and rejection verdicts pass through untouched on the first
/// attempt, as do non-transient carrier errors.
pub struct RetryingNotaryClient {
    inner: Arc<dyn NotaryClient>,
    policy: RetryPolicy,
}

impl RetryingNotaryClient {
    /// Decorates `inner` with the given policy.
    pub fn new(inner: Arc<dyn NotaryClient>, policy: RetryPolicy) -> Self {
        RetryingNotaryClient { inner, policy }
    }
}

fn worth_retrying(outcome: &Result<NotarisationResult, CoreError>) -> bool {
    match outcome {
        Ok(verdict) => !verdict.is_definitive(),
        Err(err) => err.classify() == FailureClass::Transient,
    }
}

#[async_trait]
impl NotaryClient for RetryingNotaryClient {
    async fn notarise(
        &self,
        request: &NotarisationRequest,
    ) -> Result<NotarisationResult, CoreError> {
        let attempts = self.policy.max_attempts.max(1);
        let max_backoff = Duration::from_millis(self.policy.max_backoff_ms);
        let mut backoff = Duration::from_millis(self.policy.initial_backoff_ms);

        let mut outcome = self.inner.notarise(request).await;
        for attempt in 1..attempts {
            if !worth_retrying(&outcome) {
                return outcome;
            }
            counter!("ledgerflow_notary_retries_total", 1);
            debug!(transaction = %request.transaction_id(), attempt,
                delay_ms = backoff.as_millis() as u64, "retrying notarisation");
            sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
            outcome = self.inner.notarise(request).await;
        }

        if worth_retrying(&outcome) {
            warn!(transaction = %request.transaction_id(), attempts,
                "notarisation retry budget exhausted");
        }
        outcome
    }
}
