//! Notarisation request/result types and the notary client contract.
//!
//! The notary provides uniqueness consensus: for every input state it
//! records the first transaction that consumed it and rejects every later
//! claim. A conflict verdict is definitive; clients must never retry their
//! way past one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::identity::PartyName;
use crate::domain::transaction::{PartySignature, SignedTransaction, StateRef, TransactionId};
use crate::error::CoreError;

/// A request to commit a transaction's input claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotarisationRequest {
    /// The transaction to notarise. Its id must match its content.
    pub transaction: SignedTransaction,
    /// Party submitting the request.
    pub requesting_party: PartyName,
}

impl NotarisationRequest {
    /// Builds a request.
    pub fn new(transaction: SignedTransaction, requesting_party: PartyName) -> Self {
        NotarisationRequest {
            transaction,
            requesting_party,
        }
    }

    /// Identifier of the transaction being notarised.
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction.id
    }
}

/// One input state that lost the uniqueness race.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateConflict {
    /// The contested input state.
    pub state_ref: StateRef,
    /// Transaction that consumed it first.
    pub consumed_by: TransactionId,
}

/// Classifies a notary `Error` verdict for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotaryErrorCode {
    /// The notary could not evaluate the request right now. Worth
    /// retrying.
    Unavailable,
    /// The notary evaluated the request and refused it (malformed
    /// transaction, unacceptable content). Retrying cannot help.
    Rejected,
}

/// The notary's verdict on a notarisation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NotarisationResult {
    /// Every input claim was recorded (or was already recorded for this
    /// same transaction). Carries the notary's signature over the
    /// transaction identifier.
    Committed {
        /// The committed transaction.
        transaction_id: TransactionId,
        /// Notary signature attesting the commit.
        notary_signature: PartySignature,
    },
    /// At least one input was already consumed by a different transaction.
    /// Definitive; no claim was recorded for this request.
    Conflict {
        /// The rejected transaction.
        transaction_id: TransactionId,
        /// Every contested input and who consumed it.
        conflicts: Vec<StateConflict>,
    },
    /// The notary did not commit the claims and reported why.
    Error {
        /// Whether the failure is worth retrying.
        code: NotaryErrorCode,
        /// What went wrong on the notary side.
        message: String,
    },
}

impl NotarisationResult {
    /// Shorthand for a retriable error verdict.
    pub fn unavailable(message: impl Into<String>) -> Self {
        NotarisationResult::Error {
            code: NotaryErrorCode::Unavailable,
            message: message.into(),
        }
    }

    /// Shorthand for a definitive rejection verdict.
    pub fn rejected(message: impl Into<String>) -> Self {
        NotarisationResult::Error {
            code: NotaryErrorCode::Rejected,
            message: message.into(),
        }
    }

    /// True for the committed verdict.
    pub fn is_committed(&self) -> bool {
        matches!(self, NotarisationResult::Committed { .. })
    }

    /// True for verdicts that settle the request one way or the other:
    /// everything except a retriable `Unavailable` error.
    pub fn is_definitive(&self) -> bool {
        !matches!(
            self,
            NotarisationResult::Error {
                code: NotaryErrorCode::Unavailable,
                ..
            }
        )
    }

    /// Converts a conflict verdict into the matching error, for flows that
    /// propagate rather than handle it.
    pub fn into_conflict_error(self) -> Option<CoreError> {
        match self {
            NotarisationResult::Conflict {
                transaction_id,
                conflicts,
            } => Some(CoreError::ConsensusConflict {
                transaction_id,
                conflicting: conflicts,
            }),
            _ => None,
        }
    }
}

/// Client-side contract for talking to a notary.
///
/// `Err` means the carrier failed and the verdict is unknown; retrying is
/// the caller's (or a retry decorator's) business. `Ok` carries the
/// notary's actual verdict, including `Error` for notary-side faults.
/// Implementations must never synthesise a `Committed` verdict locally.
#[async_trait]
pub trait NotaryClient: Send + Sync {
    /// Submits a request and returns the notary's verdict.
    async fn notarise(&self, request: &NotarisationRequest)
        -> Result<NotarisationResult, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::identity::KeyId;
    use crate::domain::transaction::TransactionPayload;
    use crate::types::Payload;
    use serde_json::json;

    fn sample_request() -> NotarisationRequest {
        let tx = SignedTransaction::new(TransactionPayload::new(
            vec![StateRef::new(TransactionId::zero(), 0)],
            vec![Payload::new(json!({"owner": "Bob"}))],
        ))
        .unwrap();
        NotarisationRequest::new(tx, PartyName::new("Alice"))
    }

    #[test]
    fn request_exposes_transaction_id() {
        let request = sample_request();
        assert_eq!(request.transaction_id(), request.transaction.id);
    }

    #[test]
    fn committed_is_definitive() {
        let result = NotarisationResult::Committed {
            transaction_id: TransactionId::zero(),
            notary_signature: PartySignature::new(
                PartyName::new("Notary"),
                KeyId::new("notary-key"),
                vec![0u8; 64],
            ),
        };
        assert!(result.is_committed());
        assert!(result.is_definitive());
    }

    #[test]
    fn unavailable_is_not_definitive_but_rejection_is() {
        let unavailable = NotarisationResult::unavailable("claim table unavailable");
        assert!(!unavailable.is_definitive());
        assert!(unavailable.into_conflict_error().is_none());

        let rejected = NotarisationResult::rejected("transaction id mismatch");
        assert!(rejected.is_definitive());
        assert!(!rejected.is_committed());
    }

    #[test]
    fn conflict_converts_to_consensus_error() {
        let request = sample_request();
        let result = NotarisationResult::Conflict {
            transaction_id: request.transaction_id(),
            conflicts: vec![StateConflict {
                state_ref: StateRef::new(TransactionId::zero(), 0),
                consumed_by: TransactionId::zero(),
            }],
        };
        match result.into_conflict_error() {
            Some(CoreError::ConsensusConflict { conflicting, .. }) => {
                assert_eq!(conflicting.len(), 1);
            }
            other => panic!("expected consensus conflict, got {other:?}"),
        }
    }
}
