use std::collections::HashMap;

use parking_lot::Mutex;

use super::{missing_entry, CredentialStore};
use crate::CryptoError;

/// In-memory credential store.
///
/// Data is lost on process exit; used in tests and for ephemeral identities.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn store_entry(&self, namespace: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        self.entries
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn load_entry(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self
            .entries
            .lock()
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn delete_entry(&self, namespace: &str, key: &str) -> Result<(), CryptoError> {
        self.entries
            .lock()
            .get_mut(namespace)
            .and_then(|entries| entries.remove(key))
            .map(|_| ())
            .ok_or_else(|| missing_entry(namespace, key))
    }

    fn list_entries(&self, namespace: &str) -> Result<Vec<String>, CryptoError> {
        Ok(self
            .entries
            .lock()
            .get(namespace)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }
}
