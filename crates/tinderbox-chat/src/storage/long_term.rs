use std::sync::Arc;

use tinderbox_crypto::credential::{identity_namespace, NAMESPACE_LONG_TERM_KEYS};
use tinderbox_crypto::{CredentialStore, KeyId};
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::error::ChatError;
use crate::keys::LongTermKey;

/// Long-term keys of a single identity, one credential entry per key.
/// Every call is independently durable.
pub struct LongTermKeyStore {
    identity: String,
    namespace: String,
    backend: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
}

impl LongTermKeyStore {
    pub fn new(identity: impl Into<String>, backend: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        let identity = identity.into();
        Self {
            namespace: identity_namespace(NAMESPACE_LONG_TERM_KEYS, &identity),
            identity,
            backend,
            clock,
        }
    }

    /// Persist a new key created now.
    pub fn store(&self, key_material: &[u8], id: KeyId) -> Result<LongTermKey, ChatError> {
        if self.backend.entry_exists(&self.namespace, &id.to_hex())? {
            return Err(ChatError::KeyAlreadyExists(id));
        }
        let key = LongTermKey {
            id,
            key_material: Zeroizing::new(key_material.to_vec()),
            creation_date: self.clock.now_ms(),
            outdated_from: None,
        };
        self.write(&key)?;
        tracing::debug!(identity = %self.identity, key_id = %id, "long-term key stored");
        Ok(key)
    }

    pub fn retrieve(&self, id: KeyId) -> Result<LongTermKey, ChatError> {
        let data = self
            .backend
            .load_entry(&self.namespace, &id.to_hex())?
            .ok_or(ChatError::KeyNotFound(id))?;
        let data = Zeroizing::new(data);
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn delete(&self, id: KeyId) -> Result<(), ChatError> {
        let entry = id.to_hex();
        if !self.backend.entry_exists(&self.namespace, &entry)? {
            return Err(ChatError::KeyNotFound(id));
        }
        self.backend.delete_entry(&self.namespace, &entry)?;
        Ok(())
    }

    /// All keys, oldest first.
    pub fn list_all(&self) -> Result<Vec<LongTermKey>, ChatError> {
        let mut keys = Vec::new();
        for entry in self.backend.list_entries(&self.namespace)? {
            let id = KeyId::from_hex(&entry)?;
            keys.push(self.retrieve(id)?);
        }
        keys.sort_by_key(|key| (key.creation_date, key.id));
        Ok(keys)
    }

    pub fn mark_outdated(&self, id: KeyId, since_ms: u64) -> Result<(), ChatError> {
        let mut key = self.retrieve(id)?;
        if let Some(outdated_from) = key.outdated_from {
            return Err(ChatError::Conflict(format!(
                "long-term key {id} already outdated since {outdated_from}"
            )));
        }
        key.outdated_from = Some(since_ms);
        self.write(&key)
    }

    /// Erase every long-term key of this identity.
    pub fn reset(&self) -> Result<(), ChatError> {
        for entry in self.backend.list_entries(&self.namespace)? {
            self.backend.delete_entry(&self.namespace, &entry)?;
        }
        tracing::debug!(identity = %self.identity, "long-term keys reset");
        Ok(())
    }

    fn write(&self, key: &LongTermKey) -> Result<(), ChatError> {
        let data = Zeroizing::new(serde_json::to_vec(key)?);
        self.backend
            .store_entry(&self.namespace, &key.id.to_hex(), &data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;
    use tinderbox_crypto::MemoryCredentialStore;

    fn store(clock: &ManualClock) -> LongTermKeyStore {
        LongTermKeyStore::new(
            "alice",
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(clock.clone()),
        )
    }

    fn id(n: u8) -> KeyId {
        KeyId::from([n; 8])
    }

    #[test]
    fn store_stamps_creation_date() {
        let clock = ManualClock::new(5_000);
        let store = store(&clock);

        let key = store.store(&[1; 32], id(1)).unwrap();
        assert_eq!(key.creation_date, 5_000);
        assert_eq!(store.retrieve(id(1)).unwrap(), key);
        assert!(matches!(store.store(&[1; 32], id(1)), Err(ChatError::KeyAlreadyExists(_))));
    }

    #[test]
    fn list_is_oldest_first() {
        let clock = ManualClock::new(0);
        let store = store(&clock);
        store.store(&[2; 32], id(2)).unwrap();
        clock.advance(Duration::from_secs(1));
        store.store(&[1; 32], id(1)).unwrap();

        let ids: Vec<KeyId> = store.list_all().unwrap().iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![id(2), id(1)]);
    }

    #[test]
    fn mark_outdated_twice_conflicts() {
        let clock = ManualClock::new(0);
        let store = store(&clock);
        store.store(&[1; 32], id(1)).unwrap();

        store.mark_outdated(id(1), 10).unwrap();
        assert_eq!(store.retrieve(id(1)).unwrap().outdated_from, Some(10));
        assert!(matches!(store.mark_outdated(id(1), 20), Err(ChatError::Conflict(_))));
        assert!(matches!(store.mark_outdated(id(9), 20), Err(ChatError::KeyNotFound(_))));
    }

    #[test]
    fn delete_and_reset() {
        let clock = ManualClock::new(0);
        let store = store(&clock);
        store.store(&[1; 32], id(1)).unwrap();
        store.store(&[2; 32], id(2)).unwrap();

        store.delete(id(1)).unwrap();
        assert!(matches!(store.delete(id(1)), Err(ChatError::KeyNotFound(_))));
        assert!(matches!(store.retrieve(id(1)), Err(ChatError::KeyNotFound(_))));

        store.reset().unwrap();
        store.reset().unwrap();
        assert!(store.list_all().unwrap().is_empty());
    }
}
