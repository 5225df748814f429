//! Fault injection around any checkpoint store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ledgerflow_core::{
    Checkpoint, CheckpointStore, CheckpointSummary, CoreError, FlowId, FlowStatus,
};

/// Wraps a store and fails a scripted number of upcoming operations with
/// [`CoreError::StoreError`]. Tests use it to open crash windows at exact
/// points: after a flow step but before its checkpoint, or between a
/// checkpoint and its acknowledgement.
pub struct FailpointStore {
    inner: Arc<dyn CheckpointStore>,
    failing_saves: AtomicUsize,
    failing_loads: AtomicUsize,
    saves_seen: AtomicUsize,
}

impl FailpointStore {
    /// Wraps `inner` with no failures armed.
    pub fn new(inner: Arc<dyn CheckpointStore>) -> Self {
        FailpointStore {
            inner,
            failing_saves: AtomicUsize::new(0),
            failing_loads: AtomicUsize::new(0),
            saves_seen: AtomicUsize::new(0),
        }
    }

    /// Arms the next `n` saves to fail.
    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Arms the next `n` loads to fail.
    pub fn fail_next_loads(&self, n: usize) {
        self.failing_loads.store(n, Ordering::SeqCst);
    }

    /// Save attempts observed, including failed ones.
    pub fn saves_seen(&self) -> usize {
        self.saves_seen.load(Ordering::SeqCst)
    }

    fn claim(budget: &AtomicUsize) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CheckpointStore for FailpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CoreError> {
        self.saves_seen.fetch_add(1, Ordering::SeqCst);
        if Self::claim(&self.failing_saves) {
            return Err(CoreError::StoreError("injected save failure".into()));
        }
        self.inner.save(checkpoint).await
    }

    async fn load(&self, flow_id: &FlowId) -> Result<Option<Checkpoint>, CoreError> {
        if Self::claim(&self.failing_loads) {
            return Err(CoreError::StoreError("injected load failure".into()));
        }
        self.inner.load(flow_id).await
    }

    async fn delete(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        self.inner.delete(flow_id).await
    }

    async fn list(&self, status: Option<FlowStatus>) -> Result<Vec<CheckpointSummary>, CoreError> {
        self.inner.list(status).await
    }

    async fn acquire_lease(
        &self,
        flow_id: &FlowId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        self.inner.acquire_lease(flow_id, owner, ttl).await
    }

    async fn release_lease(&self, flow_id: &FlowId, owner: &str) -> Result<(), CoreError> {
        self.inner.release_lease(flow_id, owner).await
    }
}
