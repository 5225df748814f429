//! Client for a network-attached HSM gateway.
//!
//! The gateway fronts the vendor driver: a session is opened against a
//! slot with its PIN, and signing requests reference that session. The
//! gateway may expire sessions at any time; a request that comes back
//! 401 is retried once on a fresh session.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use ledgerflow_core::{KeyId, SigningError, SigningService};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;
use zeroize::Zeroizing;

#[derive(Serialize)]
struct OpenSessionRequest<'a> {
    slot: u32,
    pin: &'a str,
}

#[derive(Deserialize)]
struct OpenSessionResponse {
    session: String,
}

/// Signs through a hardware security module behind an HTTP gateway.
pub struct HsmSigner {
    endpoint: String,
    slot: u32,
    pin: Zeroizing<String>,
    client: reqwest::Client,
    session: Mutex<Option<String>>,
}

impl fmt::Debug for HsmSigner {
    // Never prints the PIN or session token.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HsmSigner")
            .field("endpoint", &self.endpoint)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl HsmSigner {
    /// Builds a client for the gateway at `endpoint`, using `slot`/`pin`
    /// to open sessions.
    pub fn new(
        endpoint: impl Into<String>,
        slot: u32,
        pin: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SigningError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SigningError::BackendUnavailable(format!("http client: {err}")))?;
        Ok(HsmSigner {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            slot,
            pin: Zeroizing::new(pin.into()),
            client,
            session: Mutex::new(None),
        })
    }

    fn carrier_fault(err: reqwest::Error) -> SigningError {
        SigningError::BackendUnavailable(format!("hsm gateway: {err}"))
    }

    async fn open_session(&self) -> Result<String, SigningError> {
        let mut guard = self.session.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }

        let response = self
            .client
            .post(format!("{}/session", self.endpoint))
            .json(&OpenSessionRequest {
                slot: self.slot,
                pin: self.pin.as_str(),
            })
            .send()
            .await
            .map_err(Self::carrier_fault)?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SigningError::Rejected(format!(
                "module refused credentials for slot {}",
                self.slot
            )));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SigningError::BackendUnavailable(format!(
                "hsm gateway: HTTP {status}: {detail}"
            )));
        }
        let parsed: OpenSessionResponse = response.json().await.map_err(Self::carrier_fault)?;
        debug!(slot = self.slot, "hsm session opened");
        *guard = Some(parsed.session.clone());
        Ok(parsed.session)
    }

    async fn drop_session(&self, stale: &str) {
        let mut guard = self.session.lock().await;
        if guard.as_deref() == Some(stale) {
            *guard = None;
        }
    }

    /// Posts a session-scoped request, reopening the session once if the
    /// gateway reports it expired.
    async fn call(
        &self,
        path: &str,
        key_id: &KeyId,
        payload: Value,
    ) -> Result<Value, SigningError> {
        let mut reopened = false;
        loop {
            let token = self.open_session().await?;
            let mut body = payload.clone();
            body["session"] = Value::String(token.clone());

            let response = self
                .client
                .post(format!("{}/{path}", self.endpoint))
                .json(&body)
                .send()
                .await
                .map_err(Self::carrier_fault)?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !reopened {
                debug!(slot = self.slot, "hsm session expired, reopening");
                self.drop_session(&token).await;
                reopened = true;
                continue;
            }
            if status == StatusCode::NOT_FOUND {
                return Err(SigningError::KeyNotFound(key_id.clone()));
            }
            if status.is_success() {
                return response.json().await.map_err(Self::carrier_fault);
            }
            let detail = response.text().await.unwrap_or_default();
            return Err(if status.is_client_error() {
                SigningError::Rejected(format!("hsm gateway: HTTP {status}: {detail}"))
            } else {
                SigningError::BackendUnavailable(format!("hsm gateway: HTTP {status}: {detail}"))
            });
        }
    }

    fn hex_field(value: &Value, field: &str, key_id: &KeyId) -> Result<Vec<u8>, SigningError> {
        let text = value.get(field).and_then(Value::as_str).ok_or_else(|| {
            SigningError::BackendUnavailable(format!("hsm gateway response missing {field}"))
        })?;
        hex::decode(text).map_err(|_| SigningError::InvalidKeyMaterial {
            key_id: key_id.clone(),
            detail: format!("gateway returned non-hex {field}"),
        })
    }
}

#[async_trait]
impl SigningService for HsmSigner {
    async fn sign(&self, key_id: &KeyId, message: &[u8]) -> Result<Vec<u8>, SigningError> {
        let response = self
            .call(
                "sign",
                key_id,
                json!({ "key_id": key_id.as_str(), "message": hex::encode(message) }),
            )
            .await?;
        Self::hex_field(&response, "signature", key_id)
    }

    async fn verifying_key(&self, key_id: &KeyId) -> Result<VerifyingKey, SigningError> {
        let response = self
            .call("keys", key_id, json!({ "key_id": key_id.as_str() }))
            .await?;
        let bytes = Self::hex_field(&response, "public_key", key_id)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SigningError::InvalidKeyMaterial {
                key_id: key_id.clone(),
                detail: "public key must be 32 bytes".into(),
            })?;
        VerifyingKey::from_bytes(&bytes).map_err(|err| SigningError::InvalidKeyMaterial {
            key_id: key_id.clone(),
            detail: err.to_string(),
        })
    }

    async fn contains_key(&self, key_id: &KeyId) -> Result<bool, SigningError> {
        match self.verifying_key(key_id).await {
            Ok(_) => Ok(true),
            Err(SigningError::KeyNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}
