//! Testing utilities for the ledgerflow platform.
//!
//! This crate provides standardized testing utilities for ledgerflow,
//! including mockall mocks for the core service traits, deterministic
//! in-memory signers, reusable scenario flows and a multi-node cluster
//! rig over the in-process carrier.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod flows;
pub mod mocks;
pub mod signer;

/// Re-export so downstream tests set expectations without their own
/// mockall dependency.
pub use mockall;

pub use cluster::{await_deleted, await_status, ClusterNode, TestCluster};
pub use flows::{register_scenario_flows, ProposeParams, NODE_KEY_ID};
pub use mocks::{
    create_mock_checkpoint_store, create_mock_notary_client, create_mock_signing_service,
    MockCheckpointStore, MockNotaryClient, MockSigningService,
};
pub use signer::{key_seed, mount_signer_device, SignerDevice, TestSigner};
