//! First-committer-wins claim table.

use dashmap::DashMap;
use ledgerflow_core::{StateConflict, StateRef, TransactionId};
use tokio::sync::Mutex;

/// Records which transaction consumed each input state.
///
/// Claiming is two-phase under a single gate: check every input, then
/// record every input. The gate serializes requests, so of two
/// transactions racing for the same input exactly one commits; the loser
/// is told who beat it. Re-claiming inputs for a transaction that already
/// owns them succeeds, which makes notarisation idempotent.
#[derive(Default)]
pub struct UniquenessProvider {
    claims: DashMap<StateRef, TransactionId>,
    gate: Mutex<()>,
}

impl UniquenessProvider {
    /// Empty claim table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claims every input for `tx`. On conflict nothing is
    /// recorded and every contested input is reported.
    pub async fn claim(
        &self,
        tx: TransactionId,
        inputs: &[StateRef],
    ) -> Result<(), Vec<StateConflict>> {
        let _gate = self.gate.lock().await;

        let conflicts: Vec<StateConflict> = inputs
            .iter()
            .filter_map(|input| {
                self.claims.get(input).and_then(|owner| {
                    if *owner == tx {
                        None
                    } else {
                        Some(StateConflict {
                            state_ref: input.clone(),
                            consumed_by: *owner,
                        })
                    }
                })
            })
            .collect();

        if !conflicts.is_empty() {
            return Err(conflicts);
        }
        for input in inputs {
            self.claims.insert(input.clone(), tx);
        }
        Ok(())
    }

    /// Who consumed a state, if anyone.
    pub fn consumed_by(&self, state: &StateRef) -> Option<TransactionId> {
        self.claims.get(state).map(|owner| *owner)
    }

    /// Number of recorded claims.
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// True when no claims are recorded.
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(byte: u8) -> TransactionId {
        TransactionId([byte; 32])
    }

    fn state(byte: u8, index: u32) -> StateRef {
        StateRef::new(tx(byte), index)
    }

    #[tokio::test]
    async fn first_claim_wins_and_is_remembered() {
        let table = UniquenessProvider::new();
        table.claim(tx(1), &[state(9, 0)]).await.unwrap();
        assert_eq!(table.consumed_by(&state(9, 0)), Some(tx(1)));

        let conflicts = table.claim(tx(2), &[state(9, 0)]).await.unwrap_err();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].consumed_by, tx(1));
        // The loser's claim left no trace.
        assert_eq!(table.consumed_by(&state(9, 0)), Some(tx(1)));
    }

    #[tokio::test]
    async fn reclaim_by_the_same_transaction_is_idempotent() {
        let table = UniquenessProvider::new();
        let inputs = [state(9, 0), state(9, 1)];
        table.claim(tx(1), &inputs).await.unwrap();
        table.claim(tx(1), &inputs).await.unwrap();
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn partial_overlap_commits_nothing() {
        let table = UniquenessProvider::new();
        table.claim(tx(1), &[state(9, 0)]).await.unwrap();

        // tx2 wants a fresh state and a consumed one: denied atomically.
        let conflicts = table
            .claim(tx(2), &[state(9, 1), state(9, 0)])
            .await
            .unwrap_err();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(table.consumed_by(&state(9, 1)), None);
    }

    #[tokio::test]
    async fn concurrent_racers_produce_one_winner() {
        let table = std::sync::Arc::new(UniquenessProvider::new());
        let contested = state(9, 0);

        let mut handles = Vec::new();
        for i in 1..=8u8 {
            let table = table.clone();
            let input = contested.clone();
            handles.push(tokio::spawn(
                async move { table.claim(tx(i), &[input]).await },
            ));
        }

        let mut committed = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                committed += 1;
            }
        }
        assert_eq!(committed, 1);
    }
}
