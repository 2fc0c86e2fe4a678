//! Single-identity fixture over a shared in-memory directory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tinderbox_crypto::{DalekCrypto, Identity, KeyId, MemoryCredentialStore, X3dhRatchet};

use crate::clock::ManualClock;
use crate::config::ChatConfig;
use crate::context::{ChatContext, Shared};
use crate::distribution::{DirectoryClient, DistributionError, InMemoryDirectory, KeyDistributionService, ValidationResult};
use crate::establish::SessionEstablisher;
use crate::keys::{IdentityPublicKeySet, Participant, PublicKeySet, SignedPublicKey};
use crate::rotation::KeysRotator;

pub(crate) struct FixtureOptions {
    pub desired_one_time_keys: usize,
    pub long_term_key_ttl_secs: u64,
    pub replenish_debounce_ms: u64,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            desired_one_time_keys: 10,
            long_term_key_ttl_secs: 3_600,
            replenish_debounce_ms: 10,
        }
    }
}

#[derive(Default)]
pub(crate) struct Faults {
    fail_uploads: AtomicBool,
}

impl Faults {
    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }
}

/// Directory client whose uploads can be made to fail.
struct FaultyDirectory {
    inner: DirectoryClient,
    faults: Arc<Faults>,
}

#[async_trait]
impl KeyDistributionService for FaultyDirectory {
    async fn upload_public_keys(
        &self,
        identity_card_id: Option<&str>,
        long_term_key: Option<&SignedPublicKey>,
        one_time_keys: &[Vec<u8>],
    ) -> Result<(), DistributionError> {
        if self.faults.fail_uploads.load(Ordering::SeqCst) {
            return Err(DistributionError::Transport("injected upload failure".into()));
        }
        self.inner
            .upload_public_keys(identity_card_id, long_term_key, one_time_keys)
            .await
    }

    async fn validate_public_keys(
        &self,
        long_term_key_id: Option<KeyId>,
        one_time_key_ids: &[KeyId],
    ) -> Result<ValidationResult, DistributionError> {
        self.inner.validate_public_keys(long_term_key_id, one_time_key_ids).await
    }

    async fn get_public_key_set(&self, identity: &str) -> Result<PublicKeySet, DistributionError> {
        self.inner.get_public_key_set(identity).await
    }

    async fn get_multiple_public_key_sets(
        &self,
        identities: &[String],
    ) -> Result<Vec<IdentityPublicKeySet>, DistributionError> {
        self.inner.get_multiple_public_key_sets(identities).await
    }

    async fn delete_keys_entity(&self) -> Result<(), DistributionError> {
        self.inner.delete_keys_entity().await
    }
}

pub(crate) struct Fixture {
    pub shared: Arc<Shared>,
    pub rotator: KeysRotator,
    pub establisher: SessionEstablisher,
    pub directory: Arc<InMemoryDirectory>,
    pub client: DirectoryClient,
    pub clock: ManualClock,
    pub faults: Arc<Faults>,
}

impl Fixture {
    /// Identity "bob" on a fresh directory.
    pub fn new(options: FixtureOptions) -> Self {
        let directory = InMemoryDirectory::new(Arc::new(DalekCrypto));
        Self::join(&directory, "bob", options)
    }

    /// Another identity on an existing directory.
    pub fn join(directory: &Arc<InMemoryDirectory>, identity: &str, options: FixtureOptions) -> Self {
        let crypto = Arc::new(DalekCrypto);
        let identity_key = Identity::generate();
        let client = directory.client(identity, identity_key.public_key_bytes());
        let faults = Arc::new(Faults::default());
        let clock = ManualClock::new(1_700_000_000_000);

        let config = ChatConfig {
            desired_one_time_keys: options.desired_one_time_keys,
            long_term_key_ttl_secs: options.long_term_key_ttl_secs,
            replenish_debounce_ms: options.replenish_debounce_ms,
            ..ChatConfig::default()
        };
        let shared = Arc::new(
            Shared::new(ChatContext {
                identity: identity.to_string(),
                identity_card_id: format!("card-{identity}"),
                identity_key,
                crypto: crypto.clone(),
                credentials: Arc::new(MemoryCredentialStore::new()),
                directory: Arc::new(FaultyDirectory {
                    inner: client.clone(),
                    faults: faults.clone(),
                }),
                ratchet: Arc::new(X3dhRatchet::new(crypto)),
                clock: Arc::new(clock.clone()),
                config,
            })
            .expect("fixture config is valid"),
        );

        Self {
            rotator: KeysRotator::new(shared.clone()),
            establisher: SessionEstablisher::new(shared.clone()),
            shared,
            directory: directory.clone(),
            client,
            clock,
            faults,
        }
    }

    pub fn participant(&self) -> Participant {
        Participant::new(
            self.shared.identity.clone(),
            self.shared.identity_key.public_key_bytes(),
        )
    }
}
