//! HTTP client for a remote notary service.

use std::time::Duration;

use async_trait::async_trait;
use ledgerflow_core::{Codec, CoreError, NotarisationRequest, NotarisationResult, NotaryClient};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::{debug, warn};

/// Talks to a notary over HTTP.
///
/// Requests are POSTed to `{base_url}/notarise` in the versioned wire
/// encoding. Faults are split along the trait contract: carrier failures
/// (connect, timeout) become `Err` because no verdict was received, while
/// notary-side HTTP failures become an `Error` verdict so the caller can
/// tell a refusal from an outage.
pub struct HttpNotaryClient {
    base_url: String,
    client: reqwest::Client,
    codec: Codec,
}

impl HttpNotaryClient {
    /// Builds a client for the notary at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| CoreError::ConfigError(format!("notary http client: {err}")))?;
        Ok(HttpNotaryClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            codec: Codec::new(),
        })
    }

    fn map_send_error(&self, error: reqwest::Error) -> CoreError {
        if error.is_timeout() {
            CoreError::TimeoutError(format!("notary request timed out: {error}"))
        } else {
            CoreError::TransportError(format!("notary unreachable: {error}"))
        }
    }
}

#[async_trait]
impl NotaryClient for HttpNotaryClient {
    async fn notarise(
        &self,
        request: &NotarisationRequest,
    ) -> Result<NotarisationResult, CoreError> {
        let url = format!("{}/notarise", self.base_url);
        let body = self.codec.encode(request)?;
        debug!(transaction = %request.transaction_id(), url = %url,
            "submitting notarisation request");

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| self.map_send_error(err))?;

        let status = response.status();
        if status == StatusCode::OK {
            let bytes = response
                .bytes()
                .await
                .map_err(|err| self.map_send_error(err))?;
            return match self.codec.decode::<NotarisationResult>(&bytes) {
                Ok(verdict) => Ok(verdict),
                Err(err) => {
                    warn!(transaction = %request.transaction_id(), error = %err,
                        "undecodable notary response");
                    Ok(NotarisationResult::unavailable(format!(
                        "undecodable notary response: {err}"
                    )))
                }
            };
        }

        let detail = response.text().await.unwrap_or_default();
        warn!(transaction = %request.transaction_id(), status = %status,
            "notary returned failure status");
        if status.is_client_error() {
            // The service understood us and refused; nothing to retry.
            Ok(NotarisationResult::rejected(format!(
                "notary refused request: HTTP {status}: {detail}"
            )))
        } else {
            Ok(NotarisationResult::unavailable(format!(
                "notary returned HTTP {status}: {detail}"
            )))
        }
    }
}
