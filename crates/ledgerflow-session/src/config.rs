//! Session layer tuning knobs.

use serde::{Deserialize, Serialize};

/// Configuration for a node's [`SessionHub`](crate::SessionHub).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long an outbound frame may stay unacknowledged before it is
    /// retransmitted.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Retransmissions per frame before the session is declared broken.
    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: u32,

    /// Inbound frames buffered per session. Arrivals beyond this are
    /// dropped and left to retransmission, which is how backpressure
    /// reaches the sender.
    #[serde(default = "default_receive_buffer")]
    pub receive_buffer: usize,
}

fn default_ack_timeout_ms() -> u64 {
    1_000
}

fn default_max_retransmits() -> u32 {
    5
}

fn default_receive_buffer() -> usize {
    256
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retransmits: default_max_retransmits(),
            receive_buffer: default_receive_buffer(),
        }
    }
}

impl SessionConfig {
    /// Tight timings for tests, so retransmission and breakage paths run
    /// in milliseconds instead of seconds.
    pub fn fast() -> Self {
        SessionConfig {
            ack_timeout_ms: 40,
            max_retransmits: 3,
            receive_buffer: 64,
        }
    }
}
