//! Engine tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a node's [`FlowScheduler`](crate::FlowScheduler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Flow steps allowed to run concurrently.
    #[serde(default = "default_worker_permits")]
    pub worker_permits: usize,

    /// Automatic re-runs of a failing step before the flow is parked
    /// for operator attention.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Base delay before a failed step is re-run. Doubles with every
    /// consecutive failure.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound on the retry delay.
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,

    /// Lifetime of the activation lease a scheduler holds on each
    /// resident flow. Leases are renewed at half this interval.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Delete a flow's checkpoint as soon as it completes.
    #[serde(default)]
    pub delete_completed: bool,
}

fn default_worker_permits() -> usize {
    8
}

fn default_retry_budget() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_retry_backoff_max_ms() -> u64 {
    5_000
}

fn default_lease_ttl_ms() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            worker_permits: default_worker_permits(),
            retry_budget: default_retry_budget(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            delete_completed: false,
        }
    }
}

impl EngineConfig {
    /// Millisecond-scale settings for tests.
    pub fn fast() -> Self {
        EngineConfig {
            worker_permits: 4,
            retry_budget: 2,
            retry_backoff_ms: 10,
            retry_backoff_max_ms: 40,
            lease_ttl_ms: 2_000,
            delete_completed: false,
        }
    }

    /// Delay before the `retries`-th re-run of a failed step.
    pub fn backoff(&self, retries: u32) -> Duration {
        let shift = retries.saturating_sub(1).min(16);
        let ms = self.retry_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(self.retry_backoff_max_ms))
    }

    /// Lifetime of an activation lease.
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}
