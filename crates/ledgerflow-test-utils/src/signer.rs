//! Deterministic signing doubles.

use std::collections::HashMap;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use ledgerflow_core::{KeyId, SigningError, SigningService};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Derives a stable 32-byte seed from a label, so every test that names
/// the same party or key gets the same key pair.
pub fn key_seed(label: &str) -> [u8; 32] {
    Sha256::digest(label.as_bytes()).into()
}

/// In-memory signer holding fixed ed25519 keys.
#[derive(Debug, Default)]
pub struct TestSigner {
    keys: HashMap<String, SigningKey>,
}

impl TestSigner {
    /// A signer with no keys; chain [`with_key`](Self::with_key) to add
    /// them.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key named `name`, derived from `seed`.
    pub fn with_key(mut self, name: &str, seed: [u8; 32]) -> Self {
        self.keys
            .insert(name.to_string(), SigningKey::from_bytes(&seed));
        self
    }

    /// The public half of a held key.
    pub fn public_key(&self, name: &str) -> Option<VerifyingKey> {
        self.keys.get(name).map(|key| key.verifying_key())
    }
}

#[async_trait]
impl SigningService for TestSigner {
    async fn sign(&self, key_id: &KeyId, message: &[u8]) -> Result<Vec<u8>, SigningError> {
        let key = self
            .keys
            .get(key_id.as_str())
            .ok_or_else(|| SigningError::KeyNotFound(key_id.clone()))?;
        Ok(key.sign(message).to_bytes().to_vec())
    }

    async fn verifying_key(&self, key_id: &KeyId) -> Result<VerifyingKey, SigningError> {
        let key = self
            .keys
            .get(key_id.as_str())
            .ok_or_else(|| SigningError::KeyNotFound(key_id.clone()))?;
        Ok(key.verifying_key())
    }

    async fn contains_key(&self, key_id: &KeyId) -> Result<bool, SigningError> {
        Ok(self.keys.contains_key(key_id.as_str()))
    }
}

/// Plays a remote signing device: signs submitted messages with one
/// fixed key and echoes request ids, which is the contract the HTTP
/// signing backend expects.
pub struct SignerDevice {
    key: SigningKey,
}

impl SignerDevice {
    /// A device holding the key derived from `seed`.
    pub fn new(seed: [u8; 32]) -> Self {
        SignerDevice {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// The public half of the device key.
    pub fn public_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl Respond for SignerDevice {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(_) => return ResponseTemplate::new(400),
        };
        let message = match body["message"].as_str().and_then(|text| hex::decode(text).ok()) {
            Some(message) => message,
            None => return ResponseTemplate::new(400),
        };
        let signature = self.key.sign(&message);
        ResponseTemplate::new(200).set_body_json(json!({
            "request_id": body["request_id"],
            "signature": hex::encode(signature.to_bytes()),
        }))
    }
}

/// Mounts a signing device on `server`: `POST /sign` signs with the key
/// derived from `seed` and `GET /keys/<id>` serves its public half.
pub async fn mount_signer_device(server: &MockServer, seed: [u8; 32]) {
    let device = SignerDevice::new(seed);
    let public_key = hex::encode(device.public_key().to_bytes());
    Mock::given(method("GET"))
        .and(path_regex("^/keys/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "public_key": public_key })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sign"))
        .respond_with(device)
        .mount(server)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};

    #[test]
    fn seeds_are_stable_and_distinct() {
        assert_eq!(key_seed("Alice"), key_seed("Alice"));
        assert_ne!(key_seed("Alice"), key_seed("Bob"));
    }

    #[tokio::test]
    async fn signatures_verify_against_the_public_key() {
        let signer = TestSigner::new().with_key("node-key", key_seed("Alice"));
        let raw = signer
            .sign(&KeyId::new("node-key"), b"digest")
            .await
            .unwrap();

        let signature = Signature::from_bytes(&raw.try_into().unwrap());
        signer
            .public_key("node-key")
            .unwrap()
            .verify(b"digest", &signature)
            .unwrap();
    }

    #[tokio::test]
    async fn missing_key_is_reported() {
        let signer = TestSigner::new();
        let err = signer
            .sign(&KeyId::new("ghost"), b"digest")
            .await
            .unwrap_err();
        assert!(matches!(err, SigningError::KeyNotFound(_)));
    }
}
