//! The three signing backends against their transports: a real keystore
//! file on disk and wiremock doubles for the remote device and the HSM
//! gateway.

use std::time::Duration;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use ledgerflow_core::{CoreError, KeyId, SigningBackend, SigningError, SigningService};
use ledgerflow_signing::{build_signing_service, HsmSigner, LocalKeystoreSigner, RemoteDeviceSigner};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const DEVICE_KEY: [u8; 32] = [11u8; 32];

fn device_key() -> SigningKey {
    SigningKey::from_bytes(&DEVICE_KEY)
}

/// Plays the signing device: signs the submitted message and echoes the
/// request id.
struct DeviceResponder;

impl Respond for DeviceResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let message = hex::decode(body["message"].as_str().unwrap()).unwrap();
        let signature = device_key().sign(&message);
        ResponseTemplate::new(200).set_body_json(json!({
            "request_id": body["request_id"],
            "signature": hex::encode(signature.to_bytes()),
        }))
    }
}

/// Plays the HSM gateway's signing route for an already-open session.
struct GatewayResponder;

impl Respond for GatewayResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let message = hex::decode(body["message"].as_str().unwrap()).unwrap();
        let signature = device_key().sign(&message);
        ResponseTemplate::new(200).set_body_json(json!({
            "signature": hex::encode(signature.to_bytes()),
        }))
    }
}

#[tokio::test]
async fn remote_device_signs_and_correlates_the_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sign"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(DeviceResponder)
        .expect(1)
        .mount(&server)
        .await;

    let signer = RemoteDeviceSigner::new(server.uri(), "test-token", Duration::from_secs(2)).unwrap();
    let raw = signer.sign(&KeyId::new("node-key"), b"digest").await.unwrap();

    let signature = Signature::from_bytes(&raw.try_into().unwrap());
    device_key()
        .verifying_key()
        .verify(b"digest", &signature)
        .unwrap();
}

#[tokio::test]
async fn remote_device_wrong_echo_is_refused() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sign"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "request_id": "00000000-0000-0000-0000-000000000000",
            "signature": "00",
        })))
        .mount(&server)
        .await;

    let signer = RemoteDeviceSigner::new(server.uri(), "t", Duration::from_secs(2)).unwrap();
    let err = signer.sign(&KeyId::new("node-key"), b"digest").await.unwrap_err();
    assert!(matches!(err, SigningError::BackendUnavailable(_)), "got {err:?}");
}

#[tokio::test]
async fn remote_device_missing_key_maps_to_key_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sign"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/keys/key-X"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let signer = RemoteDeviceSigner::new(server.uri(), "t", Duration::from_secs(2)).unwrap();
    let err = signer.sign(&KeyId::new("key-X"), b"digest").await.unwrap_err();
    assert_eq!(err, SigningError::KeyNotFound(KeyId::new("key-X")));
    assert!(!signer.contains_key(&KeyId::new("key-X")).await.unwrap());
}

#[tokio::test]
async fn remote_device_serves_the_verifying_key() {
    let server = MockServer::start().await;
    let public = device_key().verifying_key();
    Mock::given(method("GET"))
        .and(path("/keys/node-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "key_id": "node-key",
            "public_key": hex::encode(public.to_bytes()),
        })))
        .mount(&server)
        .await;

    let signer = RemoteDeviceSigner::new(server.uri(), "t", Duration::from_secs(2)).unwrap();
    let fetched = signer.verifying_key(&KeyId::new("node-key")).await.unwrap();
    assert_eq!(fetched, public);
}

#[tokio::test]
async fn hsm_opens_a_session_and_signs_through_it() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .and(body_string_contains("\"slot\":3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"session": "s-1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sign"))
        .and(body_string_contains("s-1"))
        .respond_with(GatewayResponder)
        .expect(1)
        .mount(&server)
        .await;

    let signer = HsmSigner::new(server.uri(), 3, "1234", Duration::from_secs(2)).unwrap();
    let raw = signer.sign(&KeyId::new("node-key"), b"digest").await.unwrap();

    let signature = Signature::from_bytes(&raw.try_into().unwrap());
    device_key()
        .verifying_key()
        .verify(b"digest", &signature)
        .unwrap();
}

#[tokio::test]
async fn hsm_refused_pin_is_a_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let signer = HsmSigner::new(server.uri(), 3, "wrong", Duration::from_secs(2)).unwrap();
    let err = signer.sign(&KeyId::new("node-key"), b"digest").await.unwrap_err();
    assert!(matches!(err, SigningError::Rejected(_)), "got {err:?}");
}

#[tokio::test]
async fn hsm_reopens_an_expired_session_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"session": "s-2"})))
        .expect(2)
        .mount(&server)
        .await;
    // First signing attempt hits an expired session.
    Mock::given(method("POST"))
        .and(path("/sign"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sign"))
        .respond_with(GatewayResponder)
        .expect(1)
        .mount(&server)
        .await;

    let signer = HsmSigner::new(server.uri(), 3, "1234", Duration::from_secs(2)).unwrap();
    signer.sign(&KeyId::new("node-key"), b"digest").await.unwrap();
}

#[tokio::test]
async fn backend_selection_builds_the_matching_service() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.json");
    LocalKeystoreSigner::generate(&path, &[KeyId::new("node-key")]).unwrap();

    let service = build_signing_service(&SigningBackend::LocalKeystore { path: path.clone() }).unwrap();
    assert!(service.contains_key(&KeyId::new("node-key")).await.unwrap());

    build_signing_service(&SigningBackend::HardwareModule {
        endpoint: "http://hsm.internal".into(),
        slot: 1,
        pin: "0000".into(),
    })
    .unwrap();

    let missing = build_signing_service(&SigningBackend::LocalKeystore {
        path: dir.path().join("absent.json"),
    })
    .unwrap_err();
    assert!(matches!(missing, CoreError::SigningFailure(_)));
}
