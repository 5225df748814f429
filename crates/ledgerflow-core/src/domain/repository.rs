//! Checkpoint store contract.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::checkpoint::{Checkpoint, CheckpointSummary};
use crate::domain::flow::{FlowId, FlowStatus};
use crate::error::CoreError;

/// Durable storage for flow checkpoints, plus flow-level leases for
/// cross-process exclusivity.
///
/// Implementations must make [`save`](CheckpointStore::save) atomic: a
/// checkpoint is either fully readable afterwards or the previous image is,
/// never a mixture. Writes must also enforce the monotonic sequence: a
/// checkpoint is accepted only when its sequence is exactly the latest
/// persisted sequence plus one (or 0 for a flow with no images), and a
/// violation surfaces as [`CoreError::StaleCheckpoint`]. That rule is what
/// turns two workers racing on one flow into one winner and one loser.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persists a checkpoint as the new latest image of its flow.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CoreError>;

    /// Loads the latest image of a flow, if any.
    async fn load(&self, flow_id: &FlowId) -> Result<Option<Checkpoint>, CoreError>;

    /// Removes every image of a flow. Only legal once the latest image is
    /// terminal; removing an absent flow is a no-op so cleanup stays
    /// idempotent.
    async fn delete(&self, flow_id: &FlowId) -> Result<(), CoreError>;

    /// Latest image summary per flow, optionally filtered by status,
    /// ordered oldest first.
    async fn list(&self, status: Option<FlowStatus>) -> Result<Vec<CheckpointSummary>, CoreError>;

    /// Claims (or renews) the activation lease on a flow. Returns false
    /// when a different live owner holds it. Expired leases are free to
    /// take.
    async fn acquire_lease(
        &self,
        flow_id: &FlowId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError>;

    /// Releases the lease if `owner` holds it; otherwise a no-op.
    async fn release_lease(&self, flow_id: &FlowId, owner: &str) -> Result<(), CoreError>;
}
