//! mockall doubles for the platform's service traits.
//!
//! Each `create_mock_*` constructor pre-loads benign defaults for
//! happy-path wiring. Expectations match in the order they were added,
//! so a test that needs a method to fail sets explicit expectations on
//! a fresh mock instead of layering over the defaults.

use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use mockall::mock;

use ledgerflow_core::{
    Checkpoint, CheckpointStore, CheckpointSummary, CoreError, FlowId, FlowStatus, KeyId,
    NotarisationRequest, NotarisationResult, NotaryClient, PartyName, PartySignature,
    SigningError, SigningService,
};

use crate::signer::key_seed;

mock! {
    pub CheckpointStore {}

    #[async_trait]
    impl CheckpointStore for CheckpointStore {
        async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CoreError>;
        async fn load(&self, flow_id: &FlowId) -> Result<Option<Checkpoint>, CoreError>;
        async fn delete(&self, flow_id: &FlowId) -> Result<(), CoreError>;
        async fn list(
            &self,
            status: Option<FlowStatus>,
        ) -> Result<Vec<CheckpointSummary>, CoreError>;
        async fn acquire_lease(
            &self,
            flow_id: &FlowId,
            owner: &str,
            ttl: Duration,
        ) -> Result<bool, CoreError>;
        async fn release_lease(&self, flow_id: &FlowId, owner: &str) -> Result<(), CoreError>;
    }
}

mock! {
    pub NotaryClient {}

    #[async_trait]
    impl NotaryClient for NotaryClient {
        async fn notarise(
            &self,
            request: &NotarisationRequest,
        ) -> Result<NotarisationResult, CoreError>;
    }
}

mock! {
    pub SigningService {}

    #[async_trait]
    impl SigningService for SigningService {
        async fn sign(&self, key_id: &KeyId, message: &[u8]) -> Result<Vec<u8>, SigningError>;
        async fn verifying_key(&self, key_id: &KeyId) -> Result<VerifyingKey, SigningError>;
        async fn contains_key(&self, key_id: &KeyId) -> Result<bool, SigningError>;
    }
}

impl std::fmt::Debug for MockSigningService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSigningService").finish_non_exhaustive()
    }
}

/// Creates a mock store that reads as empty and accepts every write and
/// lease call.
pub fn create_mock_checkpoint_store() -> MockCheckpointStore {
    let mut mock = MockCheckpointStore::new();
    mock.expect_save().returning(|_| Ok(()));
    mock.expect_load().returning(|_| Ok(None));
    mock.expect_delete().returning(|_| Ok(()));
    mock.expect_list().returning(|_| Ok(Vec::new()));
    mock.expect_acquire_lease().returning(|_, _, _| Ok(true));
    mock.expect_release_lease().returning(|_, _| Ok(()));
    mock
}

/// Creates a mock notary that commits every request, signing the verdict
/// with a fixed key.
pub fn create_mock_notary_client() -> MockNotaryClient {
    let mut mock = MockNotaryClient::new();
    mock.expect_notarise().returning(|request| {
        let key = SigningKey::from_bytes(&key_seed("mock-notary"));
        let transaction_id = request.transaction_id();
        let signature = key.sign(transaction_id.as_bytes()).to_bytes().to_vec();
        Ok(NotarisationResult::Committed {
            transaction_id,
            notary_signature: PartySignature::new(
                PartyName::new("MockNotary"),
                KeyId::new("notary-key"),
                signature,
            ),
        })
    });
    mock
}

/// Creates a mock signer that holds every key asked for, producing real
/// signatures from one fixed seed.
pub fn create_mock_signing_service() -> MockSigningService {
    let mut mock = MockSigningService::new();
    mock.expect_sign().returning(|_, message| {
        Ok(SigningKey::from_bytes(&key_seed("mock-signer"))
            .sign(message)
            .to_bytes()
            .to_vec())
    });
    mock.expect_verifying_key()
        .returning(|_| Ok(SigningKey::from_bytes(&key_seed("mock-signer")).verifying_key()));
    mock.expect_contains_key().returning(|_| Ok(true));
    mock
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerflow_core::{Payload, SignedTransaction, StateRef, TransactionId, TransactionPayload};

    #[tokio::test]
    async fn default_store_reads_as_empty() {
        let mock = create_mock_checkpoint_store();
        assert!(mock.load(&FlowId::new()).await.unwrap().is_none());
        assert!(mock.list(None).await.unwrap().is_empty());
        assert!(mock
            .acquire_lease(&FlowId::new(), "owner", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn default_notary_commits_with_a_verifiable_signature() {
        let mock = create_mock_notary_client();
        let payload = TransactionPayload::new(
            vec![StateRef::new(TransactionId::zero(), 0)],
            vec![Payload::null()],
        );
        let tx = SignedTransaction::new(payload).unwrap();
        let request = NotarisationRequest::new(tx, PartyName::new("Alice"));

        let verdict = mock.notarise(&request).await.unwrap();
        match verdict {
            NotarisationResult::Committed {
                transaction_id,
                notary_signature,
            } => {
                let key = SigningKey::from_bytes(&key_seed("mock-notary")).verifying_key();
                notary_signature.verify(&key, &transaction_id).unwrap();
            }
            other => panic!("expected a committed verdict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sequential_expectations_model_an_outage() {
        let mut mock = MockCheckpointStore::new();
        mock.expect_save()
            .times(1)
            .returning(|_| Err(CoreError::StoreError("disk full".into())));
        mock.expect_save().returning(|_| Ok(()));

        let checkpoint = Checkpoint::initial(FlowId::new(), "noop", serde_json::Value::Null);
        assert!(mock.save(&checkpoint).await.is_err());
        assert!(mock.save(&checkpoint).await.is_ok());
    }
}
