//! Client for a remote signing device reached over HTTP.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use ledgerflow_core::{KeyId, SigningError, SigningService};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

#[derive(Serialize)]
struct SignRequest<'a> {
    request_id: Uuid,
    key_id: &'a str,
    message: String,
}

#[derive(Deserialize)]
struct SignResponse {
    request_id: Uuid,
    signature: String,
}

#[derive(Deserialize)]
struct KeyResponse {
    public_key: String,
}

/// Signs through a remote device that holds the keys.
///
/// Every request carries a fresh request id and the response must echo
/// it; a mismatched echo means the device is answering someone else's
/// request and the signature cannot be trusted.
pub struct RemoteDeviceSigner {
    endpoint: String,
    auth_token: Zeroizing<String>,
    client: reqwest::Client,
}

impl fmt::Debug for RemoteDeviceSigner {
    // Never prints the auth token.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDeviceSigner")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl RemoteDeviceSigner {
    /// Builds a client for the device at `endpoint`.
    pub fn new(
        endpoint: impl Into<String>,
        auth_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SigningError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SigningError::BackendUnavailable(format!("http client: {err}")))?;
        Ok(RemoteDeviceSigner {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            auth_token: Zeroizing::new(auth_token.into()),
            client,
        })
    }

    fn carrier_fault(err: reqwest::Error) -> SigningError {
        SigningError::BackendUnavailable(format!("signing device: {err}"))
    }

    async fn fault_for_status(
        response: reqwest::Response,
        key_id: &KeyId,
    ) -> Result<reqwest::Response, SigningError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        warn!(key = %key_id, status = %status, "signing device refused request");
        Err(match status {
            StatusCode::NOT_FOUND => SigningError::KeyNotFound(key_id.clone()),
            StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                SigningError::Rejected(format!("signing device: HTTP {status}: {detail}"))
            }
            _ => SigningError::BackendUnavailable(format!(
                "signing device: HTTP {status}: {detail}"
            )),
        })
    }
}

#[async_trait]
impl SigningService for RemoteDeviceSigner {
    async fn sign(&self, key_id: &KeyId, message: &[u8]) -> Result<Vec<u8>, SigningError> {
        let request_id = Uuid::new_v4();
        let body = SignRequest {
            request_id,
            key_id: key_id.as_str(),
            message: hex::encode(message),
        };
        debug!(key = %key_id, request = %request_id, "requesting remote signature");

        let response = self
            .client
            .post(format!("{}/sign", self.endpoint))
            .bearer_auth(&*self.auth_token)
            .json(&body)
            .send()
            .await
            .map_err(Self::carrier_fault)?;
        let response = Self::fault_for_status(response, key_id).await?;
        let parsed: SignResponse = response.json().await.map_err(Self::carrier_fault)?;

        if parsed.request_id != request_id {
            return Err(SigningError::BackendUnavailable(format!(
                "signing device answered request {} instead of {}",
                parsed.request_id, request_id
            )));
        }
        hex::decode(&parsed.signature).map_err(|_| SigningError::InvalidKeyMaterial {
            key_id: key_id.clone(),
            detail: "device returned a non-hex signature".into(),
        })
    }

    async fn verifying_key(&self, key_id: &KeyId) -> Result<VerifyingKey, SigningError> {
        let response = self
            .client
            .get(format!("{}/keys/{}", self.endpoint, key_id))
            .bearer_auth(&*self.auth_token)
            .send()
            .await
            .map_err(Self::carrier_fault)?;
        let response = Self::fault_for_status(response, key_id).await?;
        let parsed: KeyResponse = response.json().await.map_err(Self::carrier_fault)?;

        let bytes: [u8; 32] =
            hex::FromHex::from_hex(parsed.public_key.as_bytes()).map_err(|_| {
                SigningError::InvalidKeyMaterial {
                    key_id: key_id.clone(),
                    detail: "public key must be 64 hex characters".into(),
                }
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
