//! The embedded notary service and its in-process client.

use std::sync::Arc;

use async_trait::async_trait;
use ledgerflow_core::{
    CoreError, KeyId, NotarisationRequest, NotarisationResult, NotaryClient, PartyName,
    PartySignature, SigningService,
};
use metrics::counter;
use tracing::{info, warn};

use crate::uniqueness::UniquenessProvider;

/// Notary service running inside the node process.
///
/// Used by tests and by single-process clusters where one node carries the
/// notary role. Commits are signed with the notary's own key through the
/// node's [`SigningService`].
pub struct EmbeddedNotary {
    identity: PartyName,
    key_id: KeyId,
    signer: Arc<dyn SigningService>,
    uniqueness: UniquenessProvider,
}

impl EmbeddedNotary {
    /// Builds a notary signing as `identity` with `key_id`.
    pub fn new(identity: PartyName, key_id: KeyId, signer: Arc<dyn SigningService>) -> Arc<Self> {
        Arc::new(EmbeddedNotary {
            identity,
            key_id,
            signer,
            uniqueness: UniquenessProvider::new(),
        })
    }

    /// The notary's party identity.
    pub fn identity(&self) -> &PartyName {
        &self.identity
    }

    /// Read access to the claim table, for inspection in tests.
    pub fn uniqueness(&self) -> &UniquenessProvider {
        &self.uniqueness
    }

    /// Evaluates one notarisation request and produces a verdict.
    ///
    /// If claims are recorded but signing then fails, the verdict is a
    /// retriable error; the retry will find the claims already owned by
    /// the same transaction and only needs the signature to succeed.
    pub async fn process(&self, request: &NotarisationRequest) -> NotarisationResult {
        counter!("ledgerflow_notary_requests_total", 1);
        let tx = &request.transaction;

        if let Err(err) = tx.verify_id() {
            warn!(transaction = %tx.id, error = %err, "rejecting notarisation request");
            return NotarisationResult::rejected(format!("transaction rejected: {err}"));
        }

        match self.uniqueness.claim(tx.id, tx.inputs()).await {
            Ok(()) => match self.signer.sign(&self.key_id, tx.id.as_bytes()).await {
                Ok(signature) => {
                    info!(transaction = %tx.id, requester = %request.requesting_party,
                        inputs = tx.inputs().len(), "transaction notarised");
                    NotarisationResult::Committed {
                        transaction_id: tx.id,
                        notary_signature: PartySignature::new(
                            self.identity.clone(),
                            self.key_id.clone(),
                            signature,
                        ),
                    }
                }
                Err(err) => {
                    warn!(transaction = %tx.id, error = %err, "notary signature failed");
                    NotarisationResult::unavailable(format!("notary signing failed: {err}"))
                }
            },
            Err(conflicts) => {
                counter!("ledgerflow_notary_conflicts_total", 1);
                info!(transaction = %tx.id, contested = conflicts.len(),
                    "notarisation conflict");
                NotarisationResult::Conflict {
                    transaction_id: tx.id,
                    conflicts,
                }
            }
        }
    }
}

/// [`NotaryClient`] speaking directly to an [`EmbeddedNotary`] in the same
/// process.
pub struct LocalNotaryClient {
    notary: Arc<EmbeddedNotary>,
}

impl LocalNotaryClient {
    /// Client over the given embedded notary.
    pub fn new(notary: Arc<EmbeddedNotary>) -> Self {
        LocalNotaryClient { notary }
    }
}

#[async_trait]
impl NotaryClient for LocalNotaryClient {
    async fn notarise(
        &self,
        request: &NotarisationRequest,
    ) -> Result<NotarisationResult, CoreError> {
        Ok(self.notary.process(request).await)
    }
}
