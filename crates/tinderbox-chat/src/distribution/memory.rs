use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tinderbox_crypto::{CryptoProvider, KeyId};

use super::{DistributionError, KeyDistributionService, ValidationResult};
use crate::keys::{IdentityPublicKeySet, PublicKeySet, SignedPublicKey};

struct Entity {
    identity_public_key: Vec<u8>,
    card_id: Option<String>,
    long_term: Option<(KeyId, SignedPublicKey)>,
    one_time: VecDeque<(KeyId, Vec<u8>)>,
}

/// Process-local key directory shared by several identities.
///
/// Enforces the same ordering rules and single hand-out of one-time keys as
/// the remote service. Each identity talks to it through a [`DirectoryClient`].
pub struct InMemoryDirectory {
    crypto: Arc<dyn CryptoProvider>,
    entities: Mutex<HashMap<String, Entity>>,
}

impl InMemoryDirectory {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Arc<Self> {
        Arc::new(Self {
            crypto,
            entities: Mutex::new(HashMap::new()),
        })
    }

    pub fn client(self: &Arc<Self>, identity: impl Into<String>, identity_public_key: impl Into<Vec<u8>>) -> DirectoryClient {
        DirectoryClient {
            directory: Arc::clone(self),
            identity: identity.into(),
            identity_public_key: identity_public_key.into(),
        }
    }

    pub fn has_entity(&self, identity: &str) -> bool {
        self.entities.lock().contains_key(identity)
    }

    pub fn one_time_key_count(&self, identity: &str) -> usize {
        self.entities
            .lock()
            .get(identity)
            .map_or(0, |entity| entity.one_time.len())
    }

    pub fn one_time_key_ids(&self, identity: &str) -> Vec<KeyId> {
        self.entities
            .lock()
            .get(identity)
            .map(|entity| entity.one_time.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    pub fn long_term_key_id(&self, identity: &str) -> Option<KeyId> {
        self.entities
            .lock()
            .get(identity)
            .and_then(|entity| entity.long_term.as_ref().map(|(id, _)| *id))
    }

    fn upload(
        &self,
        identity: &str,
        identity_public_key: &[u8],
        card_id: Option<&str>,
        long_term_key: Option<&SignedPublicKey>,
        one_time_keys: &[Vec<u8>],
    ) -> Result<(), DistributionError> {
        let mut entities = self.entities.lock();
        let existing = entities.get(identity);

        let bound = card_id.is_some() || existing.is_some_and(|e| e.card_id.is_some());
        let has_long_term = long_term_key.is_some() || existing.is_some_and(|e| e.long_term.is_some());
        if long_term_key.is_some() && !bound {
            return Err(DistributionError::IdentityNotBound(identity.to_string()));
        }
        if !one_time_keys.is_empty() && !has_long_term {
            return Err(DistributionError::LongTermKeyMissing(identity.to_string()));
        }
        if let Some(key) = long_term_key {
            if !key.verify(self.crypto.as_ref(), identity_public_key) {
                return Err(DistributionError::Rejected("long-term key signature is invalid".into()));
            }
        }
        if card_id.is_none() && long_term_key.is_none() && one_time_keys.is_empty() {
            return Ok(());
        }

        let entity = entities.entry(identity.to_string()).or_insert_with(|| Entity {
            identity_public_key: identity_public_key.to_vec(),
            card_id: None,
            long_term: None,
            one_time: VecDeque::new(),
        });
        if let Some(card_id) = card_id {
            entity.card_id = Some(card_id.to_string());
            entity.identity_public_key = identity_public_key.to_vec();
        }
        if let Some(key) = long_term_key {
            entity.long_term = Some((self.crypto.key_id(&key.public_key), key.clone()));
        }
        for key in one_time_keys {
            entity.one_time.push_back((self.crypto.key_id(key), key.clone()));
        }
        tracing::debug!(
            identity,
            long_term = long_term_key.is_some(),
            one_time = one_time_keys.len(),
            "public keys uploaded"
        );
        Ok(())
    }

    fn validate(
        &self,
        identity: &str,
        long_term_key_id: Option<KeyId>,
        one_time_key_ids: &[KeyId],
    ) -> ValidationResult {
        let entities = self.entities.lock();
        let entity = entities.get(identity);

        let published_long_term = entity.and_then(|e| e.long_term.as_ref().map(|(id, _)| *id));
        let used_long_term_key_id = long_term_key_id.filter(|id| published_long_term != Some(*id));
        let used_one_time_key_ids = one_time_key_ids
            .iter()
            .filter(|id| !entity.is_some_and(|e| e.one_time.iter().any(|(published, _)| published == *id)))
            .copied()
            .collect();

        ValidationResult {
            used_long_term_key_id,
            used_one_time_key_ids,
        }
    }

    fn take_key_set(entities: &mut HashMap<String, Entity>, identity: &str) -> Result<PublicKeySet, DistributionError> {
        let entity = entities
            .get_mut(identity)
            .ok_or_else(|| DistributionError::UnknownIdentity(identity.to_string()))?;
        let (_, long_term) = entity
            .long_term
            .clone()
            .ok_or_else(|| DistributionError::LongTermKeyMissing(identity.to_string()))?;
        let one_time = entity.one_time.pop_front().map(|(_, key)| key);
        if one_time.is_none() {
            tracing::debug!(identity, "one-time key pool exhausted");
        }
        Ok(PublicKeySet {
            identity_public_key: entity.identity_public_key.clone(),
            long_term_public_key: long_term,
            one_time_public_key: one_time,
        })
    }
}

/// An identity's handle on an [`InMemoryDirectory`].
#[derive(Clone)]
pub struct DirectoryClient {
    directory: Arc<InMemoryDirectory>,
    identity: String,
    identity_public_key: Vec<u8>,
}

impl DirectoryClient {
    pub fn directory(&self) -> &Arc<InMemoryDirectory> {
        &self.directory
    }
}

#[async_trait]
impl KeyDistributionService for DirectoryClient {
    async fn upload_public_keys(
        &self,
        identity_card_id: Option<&str>,
        long_term_key: Option<&SignedPublicKey>,
        one_time_keys: &[Vec<u8>],
    ) -> Result<(), DistributionError> {
        self.directory.upload(
            &self.identity,
            &self.identity_public_key,
            identity_card_id,
            long_term_key,
            one_time_keys,
        )
    }

    async fn validate_public_keys(
        &self,
        long_term_key_id: Option<KeyId>,
        one_time_key_ids: &[KeyId],
    ) -> Result<ValidationResult, DistributionError> {
        if long_term_key_id.is_none() && one_time_key_ids.is_empty() {
            return Ok(ValidationResult::default());
        }
        Ok(self
            .directory
            .validate(&self.identity, long_term_key_id, one_time_key_ids))
    }

    async fn get_public_key_set(&self, identity: &str) -> Result<PublicKeySet, DistributionError> {
        let mut entities = self.directory.entities.lock();
        InMemoryDirectory::take_key_set(&mut entities, identity)
    }

    async fn get_multiple_public_key_sets(
        &self,
        identities: &[String],
    ) -> Result<Vec<IdentityPublicKeySet>, DistributionError> {
        let mut entities = self.directory.entities.lock();
        Ok(identities
            .iter()
            .filter_map(|identity| {
                InMemoryDirectory::take_key_set(&mut entities, identity)
                    .ok()
                    .map(|key_set| IdentityPublicKeySet {
                        identity: identity.clone(),
                        key_set,
                    })
            })
            .collect())
    }

    async fn delete_keys_entity(&self) -> Result<(), DistributionError> {
        if self.directory.entities.lock().remove(&self.identity).is_some() {
            tracing::debug!(identity = %self.identity, "keys entity deleted");
        }
        Ok(())
    }
}
