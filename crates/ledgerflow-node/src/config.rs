//! Configuration for a ledgerflow node.
//!
//! This module contains the configuration types and loading functionality.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use ledgerflow_core::SigningBackend;
use ledgerflow_engine::EngineConfig;
use ledgerflow_notary::RetryPolicy;
use ledgerflow_session::SessionConfig;

use crate::error::{NodeError, NodeResult};

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Party this node speaks for on the network
    pub party: String,

    /// URL of the checkpoint store (`memory://` or `sqlite://<path>`)
    #[serde(default = "default_checkpoint_store_url")]
    pub checkpoint_store_url: String,

    /// URL of the notary (`embedded://` or an http(s) endpoint)
    #[serde(default = "default_notary_url")]
    pub notary_url: String,

    /// Identity the embedded notary signs verdicts as
    #[serde(default = "default_notary_party")]
    pub notary_party: String,

    /// Key the embedded notary signs verdicts with
    #[serde(default = "default_notary_key_id")]
    pub notary_key_id: String,

    /// Request timeout for the HTTP notary client, in milliseconds
    #[serde(default = "default_notary_timeout_ms")]
    pub notary_timeout_ms: u64,

    /// Retry policy for notarisation requests
    #[serde(default)]
    pub notary_retry: RetryPolicy,

    /// Signing backend selector (`keystore`, `hsm` or `remote`)
    #[serde(default = "default_signing_backend")]
    pub signing_backend: String,

    /// Keystore file used by the `keystore` backend
    #[serde(default = "default_keystore_path")]
    pub keystore_path: String,

    /// Driver endpoint for the `hsm` backend
    #[serde(default)]
    pub hsm_endpoint: Option<String>,

    /// Token slot for the `hsm` backend
    #[serde(default)]
    pub hsm_slot: u32,

    /// Slot PIN for the `hsm` backend
    #[serde(default)]
    pub hsm_pin: Option<String>,

    /// Endpoint of the `remote` signing device
    #[serde(default)]
    pub signer_endpoint: Option<String>,

    /// Bearer token for the `remote` signing device
    #[serde(default)]
    pub signer_auth_token: Option<String>,

    /// Flow scheduler tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Session layer tuning
    #[serde(default)]
    pub session: SessionConfig,

    /// Log level filter used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON logs instead of human-readable ones
    #[serde(default)]
    pub log_json: bool,
}

fn default_checkpoint_store_url() -> String {
    "memory://".to_string()
}

fn default_notary_url() -> String {
    "embedded://".to_string()
}

fn default_notary_party() -> String {
    "Notary".to_string()
}

fn default_notary_key_id() -> String {
    "notary-key".to_string()
}

fn default_notary_timeout_ms() -> u64 {
    10_000
}

fn default_signing_backend() -> String {
    "keystore".to_string()
}

fn default_keystore_path() -> String {
    "ledgerflow-keys.json".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Checkpoint store selected by [`NodeConfig::checkpoint_store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSelection {
    /// In-memory store; checkpoints are lost on restart
    Memory,
    /// Durable sqlite store at the given path
    Sqlite(PathBuf),
}

/// Notary selected by [`NodeConfig::notary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotarySelection {
    /// Notary service running inside this node's process
    Embedded,
    /// Remote notary reached over HTTP
    Http(String),
}

impl NodeConfig {
    /// Load configuration from environment variables
    pub fn load() -> NodeResult<Self> {
        // Start with defaults
        let mut config = Self::default();

        // Override from environment variables
        if let Ok(party) = env::var("PARTY_NAME") {
            config.party = party;
        }

        if let Ok(url) = env::var("CHECKPOINT_STORE_URL") {
            config.checkpoint_store_url = url;
        }

        if let Ok(url) = env::var("NOTARY_URL") {
            config.notary_url = url;
        }

        if let Ok(party) = env::var("NOTARY_PARTY") {
            config.notary_party = party;
        }

        if let Ok(key_id) = env::var("NOTARY_KEY_ID") {
            config.notary_key_id = key_id;
        }

        if let Ok(timeout) = env::var("NOTARY_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                config.notary_timeout_ms = ms;
            } else {
                warn!("Invalid NOTARY_TIMEOUT_MS value: {}", timeout);
            }
        }

        if let Ok(attempts) = env::var("NOTARY_MAX_ATTEMPTS") {
            if let Ok(value) = attempts.parse::<u32>() {
                config.notary_retry.max_attempts = value;
            } else {
                warn!("Invalid NOTARY_MAX_ATTEMPTS value: {}", attempts);
            }
        }

        if let Ok(backoff) = env::var("NOTARY_BACKOFF_MS") {
            if let Ok(ms) = backoff.parse::<u64>() {
                config.notary_retry.initial_backoff_ms = ms;
            } else {
                warn!("Invalid NOTARY_BACKOFF_MS value: {}", backoff);
            }
        }

        if let Ok(backoff) = env::var("NOTARY_BACKOFF_MAX_MS") {
            if let Ok(ms) = backoff.parse::<u64>() {
                config.notary_retry.max_backoff_ms = ms;
            } else {
                warn!("Invalid NOTARY_BACKOFF_MAX_MS value: {}", backoff);
            }
        }

        if let Ok(backend) = env::var("SIGNING_BACKEND") {
            config.signing_backend = backend.to_lowercase();
        }

        if let Ok(path) = env::var("KEYSTORE_PATH") {
            config.keystore_path = path;
        }

        if let Ok(endpoint) = env::var("HSM_ENDPOINT") {
            config.hsm_endpoint = Some(endpoint);
        }

        if let Ok(slot) = env::var("HSM_SLOT") {
            if let Ok(value) = slot.parse::<u32>() {
                config.hsm_slot = value;
            } else {
                warn!("Invalid HSM_SLOT value: {}", slot);
            }
        }

        if let Ok(pin) = env::var("HSM_PIN") {
            config.hsm_pin = Some(pin);
        }

        if let Ok(endpoint) = env::var("SIGNER_ENDPOINT") {
            config.signer_endpoint = Some(endpoint);
        }

        if let Ok(token) = env::var("SIGNER_AUTH_TOKEN") {
            config.signer_auth_token = Some(token);
        }

        // Scheduler tuning from environment
        if let Ok(permits) = env::var("ENGINE_WORKER_PERMITS") {
            if let Ok(value) = permits.parse::<usize>() {
                config.engine.worker_permits = value;
            } else {
                warn!("Invalid ENGINE_WORKER_PERMITS value: {}", permits);
            }
        }

        if let Ok(budget) = env::var("ENGINE_RETRY_BUDGET") {
            if let Ok(value) = budget.parse::<u32>() {
                config.engine.retry_budget = value;
            } else {
                warn!("Invalid ENGINE_RETRY_BUDGET value: {}", budget);
            }
        }

        if let Ok(backoff) = env::var("ENGINE_RETRY_BACKOFF_MS") {
            if let Ok(ms) = backoff.parse::<u64>() {
                config.engine.retry_backoff_ms = ms;
            } else {
                warn!("Invalid ENGINE_RETRY_BACKOFF_MS value: {}", backoff);
            }
        }

        if let Ok(backoff) = env::var("ENGINE_RETRY_BACKOFF_MAX_MS") {
            if let Ok(ms) = backoff.parse::<u64>() {
                config.engine.retry_backoff_max_ms = ms;
            } else {
                warn!("Invalid ENGINE_RETRY_BACKOFF_MAX_MS value: {}", backoff);
            }
        }

        if let Ok(ttl) = env::var("ENGINE_LEASE_TTL_MS") {
            if let Ok(ms) = ttl.parse::<u64>() {
                config.engine.lease_ttl_ms = ms;
            } else {
                warn!("Invalid ENGINE_LEASE_TTL_MS value: {}", ttl);
            }
        }

        if let Ok(delete_completed) = env::var("ENGINE_DELETE_COMPLETED") {
            config.engine.delete_completed =
                delete_completed.to_lowercase() == "true" || delete_completed == "1";
        }

        // Session tuning from environment
        if let Ok(timeout) = env::var("SESSION_ACK_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                config.session.ack_timeout_ms = ms;
            } else {
                warn!("Invalid SESSION_ACK_TIMEOUT_MS value: {}", timeout);
            }
        }

        if let Ok(retransmits) = env::var("SESSION_MAX_RETRANSMITS") {
            if let Ok(value) = retransmits.parse::<u32>() {
                config.session.max_retransmits = value;
            } else {
                warn!("Invalid SESSION_MAX_RETRANSMITS value: {}", retransmits);
            }
        }

        if let Ok(buffer) = env::var("SESSION_RECEIVE_BUFFER") {
            if let Ok(value) = buffer.parse::<usize>() {
                config.session.receive_buffer = value;
            } else {
                warn!("Invalid SESSION_RECEIVE_BUFFER value: {}", buffer);
            }
        }

        if let Ok(log_level) = env::var("LOG_LEVEL") {
            config.log_level = log_level;
        }

        if let Ok(log_json) = env::var("LOG_JSON") {
            config.log_json = log_json.to_lowercase() == "true" || log_json == "1";
        }

        // Validate required fields
        if config.party.is_empty() {
            return Err(NodeError::ConfigError(
                "PARTY_NAME is required".to_string(),
            ));
        }

        if matches!(config.checkpoint_store()?, StoreSelection::Memory) {
            warn!("Using in-memory checkpoint store - flows will not survive a restart!");
        }
        config.notary()?;
        config.signing()?;

        info!(
            party = %config.party,
            store = %config.checkpoint_store_url,
            notary = %config.notary_url,
            signing = %config.signing_backend,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parses the checkpoint store URL.
    pub fn checkpoint_store(&self) -> NodeResult<StoreSelection> {
        let url = self.checkpoint_store_url.as_str();
        if url == "memory" || url.starts_with("memory://") {
            return Ok(StoreSelection::Memory);
        }
        if let Some(path) = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
        {
            if path.is_empty() {
                return Err(NodeError::ConfigError(
                    "CHECKPOINT_STORE_URL is missing the sqlite database path".to_string(),
                ));
            }
            return Ok(StoreSelection::Sqlite(PathBuf::from(path)));
        }
        Err(NodeError::ConfigError(format!(
            "Unsupported CHECKPOINT_STORE_URL '{url}', expected memory:// or sqlite://<path>"
        )))
    }

    /// Parses the notary URL.
    pub fn notary(&self) -> NodeResult<NotarySelection> {
        let url = self.notary_url.as_str();
        if url == "embedded" || url.starts_with("embedded://") {
            return Ok(NotarySelection::Embedded);
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(NotarySelection::Http(url.to_string()));
        }
        Err(NodeError::ConfigError(format!(
            "Unsupported NOTARY_URL '{url}', expected embedded:// or an http(s) endpoint"
        )))
    }

    /// Assembles the signing backend selection.
    pub fn signing(&self) -> NodeResult<SigningBackend> {
        match self.signing_backend.as_str() {
            "keystore" => Ok(SigningBackend::LocalKeystore {
                path: PathBuf::from(&self.keystore_path),
            }),
            "hsm" => {
                let endpoint = self.hsm_endpoint.clone().ok_or_else(|| {
                    NodeError::ConfigError(
                        "HSM_ENDPOINT is required for the hsm signing backend".to_string(),
                    )
                })?;
                let pin = self.hsm_pin.clone().ok_or_else(|| {
                    NodeError::ConfigError(
                        "HSM_PIN is required for the hsm signing backend".to_string(),
                    )
                })?;
                Ok(SigningBackend::HardwareModule {
                    endpoint,
                    slot: self.hsm_slot,
                    pin,
                })
            }
            "remote" => {
                let endpoint = self.signer_endpoint.clone().ok_or_else(|| {
                    NodeError::ConfigError(
                        "SIGNER_ENDPOINT is required for the remote signing backend".to_string(),
                    )
                })?;
                let auth_token = self.signer_auth_token.clone().ok_or_else(|| {
                    NodeError::ConfigError(
                        "SIGNER_AUTH_TOKEN is required for the remote signing backend".to_string(),
                    )
                })?;
                Ok(SigningBackend::RemoteDevice {
                    endpoint,
                    auth_token,
                })
            }
            other => Err(NodeError::ConfigError(format!(
                "Unknown signing backend '{other}', expected keystore, hsm or remote"
            ))),
        }
    }

    /// HTTP notary request timeout.
    pub fn notary_timeout(&self) -> Duration {
        Duration::from_millis(self.notary_timeout_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            party: String::new(),
            checkpoint_store_url: default_checkpoint_store_url(),
            notary_url: default_notary_url(),
            notary_party: default_notary_party(),
            notary_key_id: default_notary_key_id(),
            notary_timeout_ms: default_notary_timeout_ms(),
            notary_retry: RetryPolicy::default(),
            signing_backend: default_signing_backend(),
            keystore_path: default_keystore_path(),
            hsm_endpoint: None,
            hsm_slot: 0,
            hsm_pin: None,
            signer_endpoint: None,
            signer_auth_token: None,
            engine: EngineConfig::default(),
            session: SessionConfig::default(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}
