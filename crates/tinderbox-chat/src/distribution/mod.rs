//! Key distribution service: the remote directory peers fetch prekeys from.

mod memory;

pub use memory::{DirectoryClient, InMemoryDirectory};

use async_trait::async_trait;
use thiserror::Error;
use tinderbox_crypto::KeyId;

use crate::keys::{IdentityPublicKeySet, PublicKeySet, SignedPublicKey};

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("identity {0} is not bound to an identity card")]
    IdentityNotBound(String),

    #[error("identity {0} has no long-term key")]
    LongTermKeyMissing(String),

    #[error("unknown identity: {0}")]
    UnknownIdentity(String),

    #[error("upload rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Ids the directory reports as already consumed by peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub used_long_term_key_id: Option<KeyId>,
    pub used_one_time_key_ids: Vec<KeyId>,
}

/// Client of the key directory, scoped to one local identity.
#[async_trait]
pub trait KeyDistributionService: Send + Sync {
    /// Publish prekeys. A long-term key needs an identity binding (supplied
    /// now or earlier); one-time keys need a long-term key.
    async fn upload_public_keys(
        &self,
        identity_card_id: Option<&str>,
        long_term_key: Option<&SignedPublicKey>,
        one_time_keys: &[Vec<u8>],
    ) -> Result<(), DistributionError>;

    /// Report which of the given ids are no longer published.
    async fn validate_public_keys(
        &self,
        long_term_key_id: Option<KeyId>,
        one_time_key_ids: &[KeyId],
    ) -> Result<ValidationResult, DistributionError>;

    /// Fetch a peer's key set, consuming one of its one-time keys.
    async fn get_public_key_set(&self, identity: &str) -> Result<PublicKeySet, DistributionError>;

    /// Batched [`get_public_key_set`](Self::get_public_key_set). Unknown
    /// identities are left out of the result.
    async fn get_multiple_public_key_sets(
        &self,
        identities: &[String],
    ) -> Result<Vec<IdentityPublicKeySet>, DistributionError>;

    /// Remove everything published for the local identity.
    async fn delete_keys_entity(&self) -> Result<(), DistributionError>;
}
