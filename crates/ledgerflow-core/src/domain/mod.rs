//! Domain model of the flow platform: identities, flows, checkpoints,
//! sessions, transactions, notarisation, and the contracts the runtime is
//! assembled from.

pub mod authorization;
pub mod checkpoint;
pub mod flow;
pub mod identity;
pub mod notary;
pub mod repository;
pub mod session;
pub mod signing;
pub mod transaction;
