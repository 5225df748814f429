#![forbid(unsafe_code)]

//! Durable [`CheckpointStore`](ledgerflow_core::CheckpointStore) on
//! sqlite.
//!
//! Checkpoints are stored as JSON blobs, one row per (flow, sequence),
//! journaled in WAL mode: a crash leaves either the previous image or
//! the new one readable, never a torn write. A save is a single guarded
//! insert whose sequence check and write evaluate together under
//! sqlite's writer lock, so of two workers racing to append the same
//! successor the second inserts nothing and is told its image is stale.

pub mod connection;
pub mod migrations;
pub mod repository;

pub use connection::SqliteConnection;
pub use repository::SqliteCheckpointStore;
