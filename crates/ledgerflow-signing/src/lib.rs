#![forbid(unsafe_code)]

//! Signing backends for node identity keys.
//!
//! Every backend implements
//! [`SigningService`](ledgerflow_core::SigningService) and is selected
//! once at startup through [`build_signing_service`]. Private key
//! material never crosses the trait: callers hand over a message and a
//! [`KeyId`](ledgerflow_core::KeyId) and get signature bytes back.

use std::sync::Arc;
use std::time::Duration;

use ledgerflow_core::{CoreError, SigningBackend, SigningService};
use tracing::info;

pub mod hsm;
pub mod keystore;
pub mod remote;

pub use hsm::HsmSigner;
pub use keystore::LocalKeystoreSigner;
pub use remote::RemoteDeviceSigner;

/// Request timeout for the network-attached backends.
const BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Instantiates the configured signing backend.
///
/// The choice is fixed for the process lifetime; reconfiguring means
/// restarting the node.
pub fn build_signing_service(
    backend: &SigningBackend,
) -> Result<Arc<dyn SigningService>, CoreError> {
    info!(backend = %backend, "selecting signing backend");
    let service: Arc<dyn SigningService> = match backend {
        SigningBackend::LocalKeystore { path } => Arc::new(LocalKeystoreSigner::load(path)?),
        SigningBackend::HardwareModule {
            endpoint,
            slot,
            pin,
        } => Arc::new(HsmSigner::new(endpoint, *slot, pin, BACKEND_TIMEOUT)?),
        SigningBackend::RemoteDevice {
            endpoint,
            auth_token,
        } => Arc::new(RemoteDeviceSigner::new(endpoint, auth_token, BACKEND_TIMEOUT)?),
    };
    Ok(service)
}
