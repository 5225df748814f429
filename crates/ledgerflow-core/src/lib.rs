#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Core domain model and contracts for the Ledgerflow platform.
//!
//! This crate defines the vocabulary every other Ledgerflow crate speaks:
//! flow identities and lifecycle states, durable checkpoints, session
//! envelopes, transactions and notarisation types, plus the trait contracts
//! (checkpoint store, signing service, notary client, authorization hook)
//! that the engine wires together at startup.
//!
//! It deliberately contains no runtime: no scheduler, no I/O, no transport.
//! Those live in `ledgerflow-engine`, `ledgerflow-session` and the store
//! crates, all of which depend on the definitions here.

pub mod codec;
pub mod domain;
pub mod error;
pub mod types;

pub use codec::{Codec, CodecError, MIN_SUPPORTED_VERSION, SCHEMA_VERSION};
pub use error::{CoreError, FailureClass};
pub use types::Payload;

pub use domain::authorization::{AllowAll, AuthorizationHook, FlowAction};
pub use domain::checkpoint::{Checkpoint, CheckpointSummary};
pub use domain::flow::{FlowId, FlowStatus, Suspension};
pub use domain::identity::{KeyId, PartyName};
pub use domain::notary::{
    NotarisationRequest, NotarisationResult, NotaryClient, NotaryErrorCode, StateConflict,
};
pub use domain::repository::CheckpointStore;
pub use domain::session::{
    Envelope, EnvelopeKind, SessionId, SessionRole, SessionSnapshot, SessionState,
};
pub use domain::signing::{SigningBackend, SigningError, SigningService};
pub use domain::transaction::{
    PartySignature, SignedTransaction, StateRef, TransactionId, TransactionPayload,
};
