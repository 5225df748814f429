#![forbid(unsafe_code)]

//! In-memory [`CheckpointStore`](ledgerflow_core::CheckpointStore).
//!
//! Backs tests and single-process deployments that can afford to lose
//! flows on restart. The sequence and lease semantics are the same as the
//! durable stores'; only durability is missing. [`FailpointStore`] wraps
//! any store and fails operations on command, which is how crash windows
//! are opened in tests.

pub mod failpoint;
pub mod store;

pub use failpoint::FailpointStore;
pub use store::InMemoryCheckpointStore;
