#![forbid(unsafe_code)]

//! Uniqueness consensus for ledger transactions.
//!
//! The notary's job is small and absolute: for every input state, remember
//! the first transaction that consumed it and refuse every later claim.
//! This crate ships the service side for embedded use
//! ([`EmbeddedNotary`] over a [`UniquenessProvider`] claim table) and
//! three [`NotaryClient`](ledgerflow_core::NotaryClient) implementations:
//! in-process ([`LocalNotaryClient`]), over HTTP ([`HttpNotaryClient`]),
//! and a retry decorator ([`RetryingNotaryClient`]) that retries only
//! verdicts where the outcome is still open.

pub mod embedded;
pub mod http;
pub mod retry;
pub mod uniqueness;

pub use embedded::{EmbeddedNotary, LocalNotaryClient};
pub use http::HttpNotaryClient;
pub use retry::{RetryPolicy, RetryingNotaryClient};
pub use uniqueness::UniquenessProvider;
