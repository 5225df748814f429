//! Signing service contract and backend selection.
//!
//! Flows never touch private keys. They name a [`KeyId`] and the node's
//! configured backend produces the signature: a local keystore file, a
//! PKCS#11-style hardware module, or a remote signing device reached over
//! the network. The backend is fixed at node startup; there is no dynamic
//! plugin loading.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::identity::KeyId;
use crate::error::CoreError;

/// Failures surfaced by a signing backend.
///
/// These reach the requesting flow synchronously, because a signing failure
/// usually means misconfiguration (wrong key name, unreachable device)
/// rather than a transient fault. Whether to retry, pick another key or
/// abort is the flow's decision.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    /// The backend holds no key under this identifier.
    #[error("Key not found: {0}")]
    KeyNotFound(KeyId),

    /// The backend could not be reached or refused the connection.
    #[error("Signing backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend answered but declined to sign.
    #[error("Signing request rejected: {0}")]
    Rejected(String),

    /// Key material exists but cannot be used (wrong length, bad encoding).
    #[error("Invalid key material for {key_id}: {detail}")]
    InvalidKeyMaterial {
        /// Key whose material is unusable.
        key_id: KeyId,
        /// What is wrong with it.
        detail: String,
    },
}

impl From<SigningError> for CoreError {
    fn from(err: SigningError) -> Self {
        CoreError::SigningFailure(err.to_string())
    }
}

/// Produces signatures on behalf of the node's identity keys.
#[async_trait]
pub trait SigningService: Send + Sync + fmt::Debug {
    /// Signs a message (by convention, a transaction identifier) with the
    /// named key.
    async fn sign(&self, key_id: &KeyId, message: &[u8]) -> Result<Vec<u8>, SigningError>;

    /// Returns the public half of the named key.
    async fn verifying_key(&self, key_id: &KeyId) -> Result<VerifyingKey, SigningError>;

    /// True when the backend holds the named key.
    async fn contains_key(&self, key_id: &KeyId) -> Result<bool, SigningError>;
}

/// Which signing backend a node uses. Closed set: adding a backend is a
/// platform change, not a runtime extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SigningBackend {
    /// Keys held in a keystore file on local disk.
    LocalKeystore {
        /// Path to the keystore file.
        path: PathBuf,
    },
    /// Keys held in a hardware security module.
    HardwareModule {
        /// Module endpoint (vendor driver address).
        endpoint: String,
        /// Token slot to open.
        slot: u32,
        /// Slot PIN.
        pin: String,
    },
    /// Keys held by a remote signing device that answers over HTTP.
    RemoteDevice {
        /// Base URL of the device.
        endpoint: String,
        /// Bearer token presented on every request.
        auth_token: String,
    },
}

impl SigningBackend {
    /// Short label for logs. Never includes secrets.
    pub fn kind(&self) -> &'static str {
        match self {
            SigningBackend::LocalKeystore { .. } => "local_keystore",
            SigningBackend::HardwareModule { .. } => "hardware_module",
            SigningBackend::RemoteDevice { .. } => "remote_device",
        }
    }
}

impl fmt::Display for SigningBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_config_round_trips_with_kind_tag() {
        let backend = SigningBackend::HardwareModule {
            endpoint: "pkcs11://vault:5959".into(),
            slot: 3,
            pin: "1234".into(),
        };
        let json = serde_json::to_string(&backend).unwrap();
        assert!(json.contains("\"kind\":\"hardware_module\""));
        let back: SigningBackend = serde_json::from_str(&json).unwrap();
        assert_eq!(backend, back);
    }

    #[test]
    fn unknown_backend_kind_is_rejected() {
        let err =
            serde_json::from_str::<SigningBackend>(r#"{"kind":"cloud_kms","project":"x"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn display_never_leaks_secrets() {
        let backend = SigningBackend::RemoteDevice {
            endpoint: "https://signer.internal".into(),
            auth_token: "s3cret".into(),
        };
        let shown = backend.to_string();
        assert_eq!(shown, "remote_device");
        assert!(!shown.contains("s3cret"));
    }

    #[test]
    fn signing_errors_map_into_core_errors() {
        let err: CoreError = SigningError::KeyNotFound(KeyId::new("missing")).into();
        assert!(matches!(err, CoreError::SigningFailure(_)));
        assert!(err.to_string().contains("missing"));
    }
}
