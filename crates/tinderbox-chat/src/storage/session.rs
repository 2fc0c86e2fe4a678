use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tinderbox_crypto::credential::{identity_namespace, NAMESPACE_SESSIONS};
use tinderbox_crypto::CredentialStore;
use zeroize::Zeroizing;

use crate::error::ChatError;

/// Session name used when the caller does not pick one.
pub const DEFAULT_SESSION_NAME: &str = "default";

/// Deletion counters. A live session handle is bound to the counters seen
/// when it was stored or loaded, and stops writing once either moves.
#[derive(Default)]
struct Generations {
    resets: u64,
    deletions: HashMap<String, u64>,
}

impl Generations {
    fn binding(&self, key: String) -> SessionBinding {
        SessionBinding {
            resets: self.resets,
            deletions: self.deletions.get(&key).copied().unwrap_or(0),
            key,
        }
    }

    fn is_current(&self, binding: &SessionBinding) -> bool {
        binding.resets == self.resets
            && binding.deletions == self.deletions.get(&binding.key).copied().unwrap_or(0)
    }

    fn deleted(&mut self, key: String) {
        *self.deletions.entry(key).or_default() += 1;
    }
}

/// Ties a live session handle to the stored entry it writes through to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionBinding {
    key: String,
    resets: u64,
    deletions: u64,
}

/// Serialized ratchet sessions of one local identity, addressed by
/// `(participant identity, session name)`.
pub struct SessionStore {
    identity: String,
    namespace: String,
    backend: Arc<dyn CredentialStore>,
    generations: Mutex<Generations>,
}

impl SessionStore {
    pub fn new(identity: impl Into<String>, backend: Arc<dyn CredentialStore>) -> Self {
        let identity = identity.into();
        Self {
            namespace: identity_namespace(NAMESPACE_SESSIONS, &identity),
            identity,
            backend,
            generations: Mutex::new(Generations::default()),
        }
    }

    pub fn store_session(&self, participant: &str, name: &str, state: &[u8]) -> Result<(), ChatError> {
        let _generations = self.generations.lock();
        self.backend
            .store_entry(&self.namespace, &entry_key(participant, name), state)?;
        Ok(())
    }

    pub fn retrieve_session(&self, participant: &str, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>, ChatError> {
        Ok(self
            .backend
            .load_entry(&self.namespace, &entry_key(participant, name))?
            .map(Zeroizing::new))
    }

    pub fn session_exists(&self, participant: &str, name: &str) -> Result<bool, ChatError> {
        Ok(self
            .backend
            .entry_exists(&self.namespace, &entry_key(participant, name))?)
    }

    /// Write `state` and bind the caller to the entry.
    pub(crate) fn store_bound(&self, participant: &str, name: &str, state: &[u8]) -> Result<SessionBinding, ChatError> {
        let generations = self.generations.lock();
        let key = entry_key(participant, name);
        self.backend.store_entry(&self.namespace, &key, state)?;
        Ok(generations.binding(key))
    }

    /// Load a session together with a binding to its entry.
    pub(crate) fn retrieve_bound(
        &self,
        participant: &str,
        name: &str,
    ) -> Result<Option<(Zeroizing<Vec<u8>>, SessionBinding)>, ChatError> {
        let generations = self.generations.lock();
        let key = entry_key(participant, name);
        let Some(data) = self.backend.load_entry(&self.namespace, &key)? else {
            return Ok(None);
        };
        Ok(Some((Zeroizing::new(data), generations.binding(key))))
    }

    /// Write through a binding. Fails with [`ChatError::SessionNotFound`]
    /// once the entry was deleted or the store reset after binding.
    pub(crate) fn write_bound(
        &self,
        binding: &SessionBinding,
        participant: &str,
        name: &str,
        state: &[u8],
    ) -> Result<(), ChatError> {
        let generations = self.generations.lock();
        if !generations.is_current(binding) {
            return Err(ChatError::SessionNotFound {
                participant: participant.to_string(),
                name: name.to_string(),
            });
        }
        self.backend.store_entry(&self.namespace, &binding.key, state)?;
        Ok(())
    }

    pub fn delete_session(&self, participant: &str, name: &str) -> Result<(), ChatError> {
        let mut generations = self.generations.lock();
        let key = entry_key(participant, name);
        if !self.backend.entry_exists(&self.namespace, &key)? {
            return Err(ChatError::SessionNotFound {
                participant: participant.to_string(),
                name: name.to_string(),
            });
        }
        self.backend.delete_entry(&self.namespace, &key)?;
        generations.deleted(key);
        tracing::debug!(identity = %self.identity, participant, name, "session deleted");
        Ok(())
    }

    /// Names of every session with `participant`.
    pub fn list_sessions(&self, participant: &str) -> Result<Vec<String>, ChatError> {
        let mut names: Vec<String> = self
            .backend
            .list_entries(&self.namespace)?
            .iter()
            .filter_map(|entry| parse_entry_key(entry))
            .filter(|(owner, _)| owner == participant)
            .map(|(_, name)| name)
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn delete_all_sessions(&self, participant: &str) -> Result<(), ChatError> {
        let mut generations = self.generations.lock();
        for name in self.list_sessions(participant)? {
            let key = entry_key(participant, &name);
            self.backend.delete_entry(&self.namespace, &key)?;
            generations.deleted(key);
        }
        tracing::debug!(identity = %self.identity, participant, "all sessions deleted");
        Ok(())
    }

    /// Erase every session of this identity.
    pub fn reset(&self) -> Result<(), ChatError> {
        let mut generations = self.generations.lock();
        generations.resets += 1;
        for entry in self.backend.list_entries(&self.namespace)? {
            self.backend.delete_entry(&self.namespace, &entry)?;
        }
        tracing::debug!(identity = %self.identity, "sessions reset");
        Ok(())
    }
}

/// `hex(participant).hex(name)` keeps arbitrary strings unambiguous.
fn entry_key(participant: &str, name: &str) -> String {
    format!("{}.{}", hex::encode(participant), hex::encode(name))
}

fn parse_entry_key(entry: &str) -> Option<(String, String)> {
    let (participant, name) = entry.split_once('.')?;
    let participant = String::from_utf8(hex::decode(participant).ok()?).ok()?;
    let name = String::from_utf8(hex::decode(name).ok()?).ok()?;
    Some((participant, name))
}
