//! Shared helpers: peers on one in-memory directory with manual clocks.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tinderbox_chat::{
    ChatConfig, ChatContext, DirectoryClient, DistributionError, IdentityPublicKeySet, InMemoryDirectory,
    KeyDistributionService, LongTermKey, LongTermKeyStore, ManualClock, OneTimeKey, OneTimeKeyStore, PublicKeySet,
    SecureChat, SignedPublicKey, ValidationResult,
};
use tinderbox_crypto::{CredentialStore, DalekCrypto, Identity, KeyId, MemoryCredentialStore, X3dhRatchet};

pub const START_MS: u64 = 1_700_000_000_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short lifetimes so aging can be driven with a few clock steps.
pub fn config(desired_one_time_keys: usize) -> ChatConfig {
    ChatConfig {
        desired_one_time_keys,
        long_term_key_ttl_secs: 100,
        outdated_long_term_key_ttl_secs: 50,
        orphaned_one_time_key_ttl_secs: 30,
        replenish_debounce_ms: 10,
        rotation_interval_secs: 3_600,
    }
}

pub fn directory() -> Arc<InMemoryDirectory> {
    InMemoryDirectory::new(Arc::new(DalekCrypto))
}

pub struct Peer {
    pub chat: SecureChat,
    pub clock: ManualClock,
    pub credentials: Arc<dyn CredentialStore>,
    pub identity_secret: [u8; 32],
}

impl Peer {
    pub async fn one_time_keys(&self) -> Vec<OneTimeKey> {
        OneTimeKeyStore::new(self.chat.identity(), self.credentials.clone())
            .list_all()
            .await
            .unwrap()
    }

    pub fn long_term_keys(&self) -> Vec<LongTermKey> {
        LongTermKeyStore::new(self.chat.identity(), self.credentials.clone(), Arc::new(self.clock.clone()))
            .list_all()
            .unwrap()
    }
}

pub struct PeerBuilder<'a> {
    directory: &'a Arc<InMemoryDirectory>,
    name: String,
    config: ChatConfig,
    identity: Identity,
    credentials: Arc<dyn CredentialStore>,
    validate_delay: Option<Duration>,
}

impl<'a> PeerBuilder<'a> {
    pub fn new(directory: &'a Arc<InMemoryDirectory>, name: &str, config: ChatConfig) -> Self {
        Self {
            directory,
            name: name.to_string(),
            config,
            identity: Identity::generate(),
            credentials: Arc::new(MemoryCredentialStore::new()),
            validate_delay: None,
        }
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Hold every validation round trip for `delay`.
    pub fn slow_validation(mut self, delay: Duration) -> Self {
        self.validate_delay = Some(delay);
        self
    }

    pub fn build(self) -> Peer {
        let crypto = Arc::new(DalekCrypto);
        let clock = ManualClock::new(START_MS);
        let identity_secret = *self.identity.secret_key_bytes();
        let client = self.directory.client(self.name.clone(), self.identity.public_key_bytes());
        let directory: Arc<dyn KeyDistributionService> = match self.validate_delay {
            Some(delay) => Arc::new(SlowDirectory { inner: client, delay }),
            None => Arc::new(client),
        };

        let chat = SecureChat::new(ChatContext {
            identity_card_id: format!("card-{}", self.name),
            identity: self.name,
            identity_key: self.identity,
            crypto: crypto.clone(),
            credentials: self.credentials.clone(),
            directory,
            ratchet: Arc::new(X3dhRatchet::new(crypto)),
            clock: Arc::new(clock.clone()),
            config: self.config,
        })
        .expect("valid test config");

        Peer {
            chat,
            clock,
            credentials: self.credentials,
            identity_secret,
        }
    }
}

pub fn peer(directory: &Arc<InMemoryDirectory>, name: &str, config: ChatConfig) -> Peer {
    PeerBuilder::new(directory, name, config).build()
}

/// Directory client with a slow validation call.
struct SlowDirectory {
    inner: DirectoryClient,
    delay: Duration,
}

#[async_trait]
impl KeyDistributionService for SlowDirectory {
    async fn upload_public_keys(
        &self,
        identity_card_id: Option<&str>,
        long_term_key: Option<&SignedPublicKey>,
        one_time_keys: &[Vec<u8>],
    ) -> Result<(), DistributionError> {
        self.inner
            .upload_public_keys(identity_card_id, long_term_key, one_time_keys)
            .await
    }

    async fn validate_public_keys(
        &self,
        long_term_key_id: Option<KeyId>,
        one_time_key_ids: &[KeyId],
    ) -> Result<ValidationResult, DistributionError> {
        tokio::time::sleep(self.delay).await;
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
