//! File-backed ed25519 keystore.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use ledgerflow_core::{KeyId, SigningError, SigningService};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

const KEYSTORE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct KeystoreFile {
    version: u32,
    keys: BTreeMap<String, String>,
}

/// Signing keys loaded from a JSON keystore file.
///
/// The file maps key identifiers to hex-encoded 32-byte ed25519 seeds.
/// Seed material is zeroized as soon as the keys are built; the loaded
/// keys themselves zeroize on drop.
#[derive(Debug)]
pub struct LocalKeystoreSigner {
    keys: HashMap<String, SigningKey>,
}

impl LocalKeystoreSigner {
    /// Loads a keystore file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SigningError> {
        let path = path.as_ref();
        let content = Zeroizing::new(std::fs::read_to_string(path).map_err(|err| {
            SigningError::BackendUnavailable(format!("keystore {}: {err}", path.display()))
        })?);
        let file: KeystoreFile = serde_json::from_str(&content).map_err(|err| {
            SigningError::BackendUnavailable(format!(
                "keystore {}: not a keystore file: {err}",
                path.display()
            ))
        })?;
        if file.version != KEYSTORE_VERSION {
            return Err(SigningError::BackendUnavailable(format!(
                "keystore {}: unsupported version {}",
                path.display(),
                file.version
            )));
        }

        let mut keys = HashMap::with_capacity(file.keys.len());
        for (id, mut seed_hex) in file.keys {
            let decoded: Result<[u8; 32], _> = hex::FromHex::from_hex(seed_hex.as_bytes());
            seed_hex.zeroize();
            let seed = Zeroizing::new(decoded.map_err(|_| SigningError::InvalidKeyMaterial {
                key_id: KeyId::new(&id),
                detail: "seed must be 64 hex characters".into(),
            })?);
            keys.insert(id, SigningKey::from_bytes(&seed));
        }
        info!(path = %path.display(), keys = keys.len(), "keystore loaded");
        Ok(LocalKeystoreSigner { keys })
    }

    /// Generates fresh keys under the given identifiers and writes them to
    /// `path`, replacing any existing file.
    pub fn generate(path: impl AsRef<Path>, key_ids: &[KeyId]) -> Result<Self, SigningError> {
        let path = path.as_ref();
        let mut keys = HashMap::with_capacity(key_ids.len());
        let mut entries = BTreeMap::new();
        for id in key_ids {
            let mut seed = Zeroizing::new([0u8; 32]);
            OsRng.fill_bytes(&mut *seed);
            entries.insert(id.as_str().to_string(), hex::encode(&*seed));
            keys.insert(id.as_str().to_string(), SigningKey::from_bytes(&seed));
        }

        let file = KeystoreFile {
            version: KEYSTORE_VERSION,
            keys: entries,
        };
        let rendered = Zeroizing::new(serde_json::to_string_pretty(&file).map_err(|err| {
            SigningError::BackendUnavailable(format!("keystore encode: {err}"))
        })?);
        std::fs::write(path, rendered.as_bytes()).map_err(|err| {
            SigningError::BackendUnavailable(format!("keystore {}: {err}", path.display()))
        })?;
        for (_, mut seed_hex) in file.keys {
            seed_hex.zeroize();
        }
        info!(path = %path.display(), keys = keys.len(), "keystore generated");
        Ok(LocalKeystoreSigner { keys })
    }

    /// Identifiers of every key in the store.
    pub fn key_ids(&self) -> Vec<KeyId> {
        self.keys.keys().map(KeyId::new).collect()
    }

    fn key(&self, key_id: &KeyId) -> Result<&SigningKey, SigningError> {
        self.keys
            .get(key_id.as_str())
            .ok_or_else(|| SigningError::KeyNotFound(key_id.clone()))
    }
}

#[async_trait::async_trait]
impl SigningService for LocalKeystoreSigner {
    async fn sign(&self, key_id: &KeyId, message: &[u8]) -> Result<Vec<u8>, SigningError> {
        let key = self.key(key_id)?;
        debug!(key = %key_id, bytes = message.len(), "signing with keystore key");
        Ok(key.sign(message).to_bytes().to_vec())
    }

    async fn verifying_key(&self, key_id: &KeyId) -> Result<VerifyingKey, SigningError> {
        Ok(self.key(key_id)?.verifying_key())
    }

    async fn contains_key(&self, key_id: &KeyId) -> Result<bool, SigningError> {
        Ok(self.keys.contains_key(key_id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    fn temp_keystore() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        (dir, path)
    }

    #[tokio::test]
    async fn generated_keys_survive_a_reload() {
        let (_dir, path) = temp_keystore();
        let ids = [KeyId::new("node-key"), KeyId::new("notary-key")];
        LocalKeystoreSigner::generate(&path, &ids).unwrap();

        let signer = LocalKeystoreSigner::load(&path).unwrap();
        assert!(signer.contains_key(&ids[0]).await.unwrap());
        assert!(!signer.contains_key(&KeyId::new("other")).await.unwrap());

        let message = b"message";
        let raw = signer.sign(&ids[0], message).await.unwrap();
        let verifying = signer.verifying_key(&ids[0]).await.unwrap();
        let signature = ed25519_dalek::Signature::from_bytes(&raw.try_into().unwrap());
        verifying.verify(message, &signature).unwrap();
    }

    #[tokio::test]
    async fn missing_key_is_reported_synchronously() {
        let (_dir, path) = temp_keystore();
        let signer = LocalKeystoreSigner::generate(&path, &[KeyId::new("only")]).unwrap();
        let err = signer.sign(&KeyId::new("key-X"), b"m").await.unwrap_err();
        assert_eq!(err, SigningError::KeyNotFound(KeyId::new("key-X")));
    }

    #[test]
    fn missing_file_is_a_backend_fault() {
        let err = LocalKeystoreSigner::load("/nonexistent/keys.json").unwrap_err();
        assert!(matches!(err, SigningError::BackendUnavailable(_)));
    }

    #[test]
    fn malformed_seed_names_the_key() {
        let (_dir, path) = temp_keystore();
        std::fs::write(&path, r#"{"version":1,"keys":{"bad":"zz"}}"#).unwrap();
        match LocalKeystoreSigner::load(&path).unwrap_err() {
            SigningError::InvalidKeyMaterial { key_id, .. } => {
                assert_eq!(key_id, KeyId::new("bad"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn future_keystore_version_is_refused() {
        let (_dir, path) = temp_keystore();
        std::fs::write(&path, r#"{"version":7,"keys":{}}"#).unwrap();
        let err = LocalKeystoreSigner::load(&path).unwrap_err();
        assert!(err.to_string().contains("version 7"));
    }
}
