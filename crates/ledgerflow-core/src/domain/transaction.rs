//! Ledger transactions: content-addressed identifiers, input references and
//! signatures.

use std::fmt;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec;
use crate::domain::identity::{KeyId, PartyName};
use crate::error::CoreError;
use crate::types::Payload;

/// Content hash identifying a transaction: SHA-256 over the canonical
/// encoding of its payload. Two nodes that agree on the payload agree on
/// the identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(#[serde(with = "hex::serde")] pub [u8; 32]);

impl TransactionId {
    /// The all-zero identifier, used as a placeholder in tests and
    /// summaries.
    pub fn zero() -> Self {
        TransactionId([0u8; 32])
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self, CoreError> {
        let bytes: [u8; 32] = hex::FromHex::from_hex(hex_str).map_err(|_| {
            CoreError::SerializationError(format!("invalid transaction id: {hex_str}"))
        })?;
        Ok(TransactionId(bytes))
    }

    /// Hex rendering of the identifier.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The raw digest bytes, in signing-input form.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.to_hex())
    }
}

/// Reference to one output state of an earlier transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateRef {
    /// Transaction that produced the state.
    pub txhash: TransactionId,
    /// Output position within that transaction.
    pub index: u32,
}

impl StateRef {
    /// Builds a state reference.
    pub fn new(txhash: TransactionId, index: u32) -> Self {
        StateRef { txhash, index }
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txhash, self.index)
    }
}

/// The hashed content of a transaction: which states it consumes and which
/// it produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPayload {
    /// States consumed by this transaction.
    pub inputs: Vec<StateRef>,
    /// New states produced by this transaction, as application documents.
    pub outputs: Vec<Payload>,
}

impl TransactionPayload {
    /// Builds a payload from inputs and outputs.
    pub fn new(inputs: Vec<StateRef>, outputs: Vec<Payload>) -> Self {
        TransactionPayload { inputs, outputs }
    }

    /// Computes the content hash of this payload.
    pub fn id(&self) -> Result<TransactionId, CoreError> {
        let value = serde_json::to_value(self)?;
        let bytes = codec::canonical_bytes(&value)?;
        let digest = Sha256::digest(&bytes);
        Ok(TransactionId(digest.into()))
    }
}

/// A detached signature over a transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartySignature {
    /// Party that produced the signature.
    pub signer: PartyName,
    /// Key the backend used.
    pub key_id: KeyId,
    /// Ed25519 signature over the transaction identifier bytes.
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

impl PartySignature {
    /// Builds a signature record.
    pub fn new(signer: PartyName, key_id: KeyId, signature: Vec<u8>) -> Self {
        PartySignature {
            signer,
            key_id,
            signature,
        }
    }

    /// Verifies this signature over the given transaction identifier.
    pub fn verify(&self, key: &VerifyingKey, id: &TransactionId) -> Result<(), CoreError> {
        let bytes: [u8; 64] = self.signature.as_slice().try_into().map_err(|_| {
            CoreError::SigningFailure(format!(
                "signature from {} has length {}, expected 64",
                self.signer,
                self.signature.len()
            ))
        })?;
        let signature = Signature::from_bytes(&bytes);
        key.verify(id.as_bytes(), &signature).map_err(|_| {
            CoreError::SigningFailure(format!("signature from {} does not verify", self.signer))
        })
    }
}

/// A transaction plus the signatures collected so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// Content hash of `payload`.
    pub id: TransactionId,
    /// The transaction content.
    pub payload: TransactionPayload,
    /// Collected signatures, in collection order.
    pub signatures: Vec<PartySignature>,
}

impl SignedTransaction {
    /// Builds an unsigned transaction, computing its identifier.
    pub fn new(payload: TransactionPayload) -> Result<Self, CoreError> {
        let id = payload.id()?;
        Ok(SignedTransaction {
            id,
            payload,
            signatures: Vec::new(),
        })
    }

    /// Appends a signature.
    pub fn with_signature(mut self, signature: PartySignature) -> Self {
        self.signatures.push(signature);
        self
    }

    /// The states this transaction consumes.
    pub fn inputs(&self) -> &[StateRef] {
        &self.payload.inputs
    }

    /// Recomputes the content hash and checks it matches `id`. Rejects
    /// tampered or miscomputed transactions before they reach the notary.
    pub fn verify_id(&self) -> Result<(), CoreError> {
        let recomputed = self.payload.id()?;
        if recomputed != self.id {
            return Err(CoreError::SerializationError(format!(
                "transaction id mismatch: declared {}, content hashes to {}",
                self.id, recomputed
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::json;

    fn sample_payload() -> TransactionPayload {
        TransactionPayload::new(
            vec![StateRef::new(TransactionId::zero(), 0)],
            vec![Payload::new(json!({"owner": "Alice", "amount": 42}))],
        )
    }

    #[test]
    fn id_is_deterministic() {
        let a = sample_payload().id().unwrap();
        let b = sample_payload().id().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn id_depends_on_content() {
        let base = sample_payload().id().unwrap();
        let changed = TransactionPayload::new(
            vec![StateRef::new(TransactionId::zero(), 1)],
            vec![Payload::new(json!({"owner": "Alice", "amount": 42}))],
        )
        .id()
        .unwrap();
        assert_ne!(base, changed);
    }

    #[test]
    fn id_survives_serde_round_trip_as_hex() {
        let id = sample_payload().id().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json.len(), 66); // 64 hex chars plus quotes
        let back: TransactionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn verify_id_detects_tampering() {
        let mut tx = SignedTransaction::new(sample_payload()).unwrap();
        tx.verify_id().unwrap();

        tx.payload.outputs = vec![Payload::new(json!({"owner": "Mallory", "amount": 42}))];
        assert!(tx.verify_id().is_err());
    }

    #[test]
    fn signature_verifies_against_matching_key() {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let tx = SignedTransaction::new(sample_payload()).unwrap();
        let raw = signing_key.sign(tx.id.as_bytes());

        let signature = PartySignature::new(
            PartyName::new("Alice"),
            KeyId::new("alice-key"),
            raw.to_bytes().to_vec(),
        );
        signature
            .verify(&signing_key.verifying_key(), &tx.id)
            .unwrap();

        let other_key = SigningKey::from_bytes(&[9u8; 32]);
        assert!(signature
            .verify(&other_key.verifying_key(), &tx.id)
            .is_err());
    }

    #[test]
    fn malformed_signature_length_is_rejected() {
        let tx = SignedTransaction::new(sample_payload()).unwrap();
        let signature = PartySignature::new(
            PartyName::new("Alice"),
            KeyId::new("alice-key"),
            vec![1, 2, 3],
        );
        let key = SigningKey::from_bytes(&[7u8; 32]).verifying_key();
        assert!(signature.verify(&key, &tx.id).is_err());
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(TransactionId::from_hex("zz").is_err());
        let id = sample_payload().id().unwrap();
        assert_eq!(TransactionId::from_hex(&id.to_hex()).unwrap(), id);
    }
}
