#![forbid(unsafe_code)]

//! Session layer: reliable, ordered, deduplicated messaging between flow
//! instances on different nodes.
//!
//! Each node runs one [`SessionHub`]. The hub owns every session endpoint
//! on its node, assigns per-session sequence numbers to outbound frames,
//! retransmits until acknowledged, reorders and deduplicates inbound
//! frames, and tells the flow engine when something happened through a
//! [`SessionEvent`] channel.
//!
//! Delivery is two-phase so the engine can keep its at-least-once promise:
//! [`SessionHub::poll_delivery`] peeks the next in-order frame without
//! consuming it, and the consumption (advancing the receive cursor, which
//! triggers the cumulative acknowledgement) happens in
//! [`SessionHub::sync`], after the checkpoint covering the consumption is
//! durable. A crash between the two leaves the frame unacknowledged, so
//! the counterparty retransmits and deduplication discards the extra copy.

pub mod config;
pub mod events;
pub mod hub;
pub mod transport;

pub use config::SessionConfig;
pub use events::SessionEvent;
pub use hub::SessionHub;
pub use transport::{FaultMode, InProcessTransport, InboundFrame, MessageTransport};
