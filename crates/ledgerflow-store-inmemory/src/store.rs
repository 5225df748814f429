//! The in-memory checkpoint store.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ledgerflow_core::{
    Checkpoint, CheckpointStore, CheckpointSummary, CoreError, FlowId, FlowStatus,
};
use tracing::debug;

struct Lease {
    owner: String,
    expires_at: Instant,
}

/// Checkpoints in process memory, one monotonic sequence per flow.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    flows: DashMap<FlowId, BTreeMap<u64, Checkpoint>>,
    leases: DashMap<FlowId, Lease>,
}

impl InMemoryCheckpointStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of flows with at least one image.
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CoreError> {
        // The entry guard serializes writers for one flow, so the
        // sequence check and the insert are atomic together.
        match self.flows.entry(checkpoint.flow_id.clone()) {
            Entry::Occupied(mut held) => {
                let images = held.get_mut();
                let latest = images.keys().next_back().copied();
                let expected = latest.map_or(0, |n| n + 1);
                if checkpoint.sequence != expected {
                    return Err(CoreError::StaleCheckpoint {
                        flow_id: checkpoint.flow_id.clone(),
                        attempted: checkpoint.sequence,
                        latest: latest.unwrap_or(0),
                    });
                }
                images.insert(checkpoint.sequence, checkpoint.clone());
            }
            Entry::Vacant(free) => {
                if checkpoint.sequence != 0 {
                    return Err(CoreError::StaleCheckpoint {
                        flow_id: checkpoint.flow_id.clone(),
                        attempted: checkpoint.sequence,
                        latest: 0,
                    });
                }
                free.insert(BTreeMap::from([(0, checkpoint.clone())]));
            }
        }
        debug!(flow = %checkpoint.flow_id, sequence = checkpoint.sequence,
            status = %checkpoint.status, "checkpoint saved");
        Ok(())
    }

    async fn load(&self, flow_id: &FlowId) -> Result<Option<Checkpoint>, CoreError> {
        Ok(self
            .flows
            .get(flow_id)
            .and_then(|images| images.values().next_back().cloned()))
    }

    async fn delete(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        let terminal = match self.flows.get(flow_id) {
            None => return Ok(()),
            Some(images) => images.values().next_back().map_or(true, |c| c.is_terminal()),
        };
        if !terminal {
            return Err(CoreError::InvalidState(format!(
                "flow {flow_id} is not terminal"
            )));
        }
        self.flows.remove(flow_id);
        self.leases.remove(flow_id);
        Ok(())
    }

    async fn list(&self, status: Option<FlowStatus>) -> Result<Vec<CheckpointSummary>, CoreError> {
        let mut summaries: Vec<CheckpointSummary> = self
            .flows
            .iter()
            .filter_map(|images| images.values().next_back().map(Checkpoint::summary))
            .filter(|summary| status.map_or(true, |wanted| summary.status == wanted))
            .collect();
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.flow_id.0.cmp(&b.flow_id.0))
        });
        Ok(summaries)
    }

    async fn acquire_lease(
        &self,
        flow_id: &FlowId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let now = Instant::now();
        match self.leases.entry(flow_id.clone()) {
            Entry::Occupied(mut held) => {
                let lease = held.get();
                if lease.owner != owner && lease.expires_at > now {
                    return Ok(false);
                }
                held.insert(Lease {
                    owner: owner.to_string(),
                    expires_at: now + ttl,
                });
                Ok(true)
            }
            Entry::Vacant(free) => {
                free.insert(Lease {
                    owner: owner.to_string(),
                    expires_at: now + ttl,
                });
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, flow_id: &FlowId, owner: &str) -> Result<(), CoreError> {
        self.leases.remove_if(flow_id, |_, lease| lease.owner == owner);
        Ok(())
    }
}
