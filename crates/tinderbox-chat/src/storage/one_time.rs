use std::collections::BTreeMap;
use std::sync::Arc;

use tinderbox_crypto::credential::NAMESPACE_ONE_TIME_KEYS;
use tinderbox_crypto::{CredentialStore, KeyId};
use tokio::sync::{Mutex, MutexGuard};
use zeroize::Zeroizing;

use crate::error::ChatError;
use crate::keys::OneTimeKey;

#[derive(Default)]
struct ScopeState {
    depth: usize,
    keys: BTreeMap<KeyId, OneTimeKey>,
}

/// One-time keys of a single identity.
///
/// The whole key set lives in one credential entry. Reads and writes go
/// through a [`OneTimeKeyScope`]: the outermost scope loads the set, nested
/// scopes share it, and closing the outermost scope writes it back in one
/// piece. The store's mutex is its single-writer queue, so at most one scope
/// tree is open at a time.
pub struct OneTimeKeyStore {
    identity: String,
    backend: Arc<dyn CredentialStore>,
    queue: Mutex<ScopeState>,
}

impl OneTimeKeyStore {
    pub fn new(identity: impl Into<String>, backend: Arc<dyn CredentialStore>) -> Self {
        Self {
            identity: identity.into(),
            backend,
            queue: Mutex::new(ScopeState::default()),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Open the outermost scope, waiting for any other scope to close first.
    pub async fn begin_scope(&self) -> Result<OneTimeKeyScope<'_>, ChatError> {
        let mut state = self.queue.lock().await;
        debug_assert_eq!(state.depth, 0, "outer scope opened while another is live");
        state.keys = self.load()?;
        state.depth = 1;
        tracing::trace!(identity = %self.identity, keys = state.keys.len(), "one-time key scope opened");
        Ok(OneTimeKeyScope {
            store: self,
            state: ScopeRef::Outer(state),
            open: true,
        })
    }

    /// Snapshot of the persisted keys. Waits for an open scope to close.
    pub async fn list_all(&self) -> Result<Vec<OneTimeKey>, ChatError> {
        let _queue = self.queue.lock().await;
        Ok(self.load()?.into_values().collect())
    }

    /// Erase every one-time key of this identity.
    ///
    /// Must not be called by a task that holds a scope on this store.
    pub async fn reset(&self) -> Result<(), ChatError> {
        let _queue = self.queue.lock().await;
        if self.backend.entry_exists(NAMESPACE_ONE_TIME_KEYS, &self.identity)? {
            self.backend.delete_entry(NAMESPACE_ONE_TIME_KEYS, &self.identity)?;
        }
        tracing::debug!(identity = %self.identity, "one-time keys reset");
        Ok(())
    }

    fn load(&self) -> Result<BTreeMap<KeyId, OneTimeKey>, ChatError> {
        let Some(data) = self.backend.load_entry(NAMESPACE_ONE_TIME_KEYS, &self.identity)? else {
            return Ok(BTreeMap::new());
        };
        let data = Zeroizing::new(data);
        let keys: Vec<OneTimeKey> = serde_json::from_slice(&data)?;
        Ok(keys.into_iter().map(|key| (key.id, key)).collect())
    }

    fn flush(&self, keys: &BTreeMap<KeyId, OneTimeKey>) -> Result<(), ChatError> {
        if keys.is_empty() {
            if self.backend.entry_exists(NAMESPACE_ONE_TIME_KEYS, &self.identity)? {
                self.backend.delete_entry(NAMESPACE_ONE_TIME_KEYS, &self.identity)?;
            }
        } else {
            let records: Vec<&OneTimeKey> = keys.values().collect();
            let data = Zeroizing::new(serde_json::to_vec(&records)?);
            self.backend
                .store_entry(NAMESPACE_ONE_TIME_KEYS, &self.identity, &data)?;
        }
        tracing::debug!(identity = %self.identity, keys = keys.len(), "one-time keys flushed");
        Ok(())
    }
}

enum ScopeRef<'a> {
    Outer(MutexGuard<'a, ScopeState>),
    Nested(&'a mut ScopeState),
}

/// A live interaction with a [`OneTimeKeyStore`].
///
/// Mutations exist only on this guard. Call [`end`](Self::end) to close it and
/// observe the flush result; dropping an outermost scope without `end` still
/// flushes, logging any failure.
pub struct OneTimeKeyScope<'a> {
    store: &'a OneTimeKeyStore,
    state: ScopeRef<'a>,
    open: bool,
}

impl OneTimeKeyScope<'_> {
    fn state(&self) -> &ScopeState {
        match &self.state {
            ScopeRef::Outer(guard) => &**guard,
            ScopeRef::Nested(state) => &**state,
        }
    }

    fn state_mut(&mut self) -> &mut ScopeState {
        match &mut self.state {
            ScopeRef::Outer(guard) => &mut **guard,
            ScopeRef::Nested(state) => &mut **state,
        }
    }

    /// Enter a nested scope sharing this one's snapshot.
    pub fn nested(&mut self) -> OneTimeKeyScope<'_> {
        let store = self.store;
        let state = self.state_mut();
        state.depth += 1;
        OneTimeKeyScope {
            store,
            state: ScopeRef::Nested(state),
            open: true,
        }
    }

    pub fn depth(&self) -> usize {
        self.state().depth
    }

    pub fn store(&mut self, key_material: &[u8], id: KeyId) -> Result<OneTimeKey, ChatError> {
        let keys = &mut self.state_mut().keys;
        if keys.contains_key(&id) {
            return Err(ChatError::KeyAlreadyExists(id));
        }
        let key = OneTimeKey::new(id, key_material);
        keys.insert(id, key.clone());
        Ok(key)
    }

    pub fn retrieve(&self, id: KeyId) -> Result<OneTimeKey, ChatError> {
        self.state()
            .keys
            .get(&id)
            .cloned()
            .ok_or(ChatError::KeyNotFound(id))
    }

    pub fn delete(&mut self, id: KeyId) -> Result<(), ChatError> {
        self.state_mut()
            .keys
            .remove(&id)
            .map(|_| ())
            .ok_or(ChatError::KeyNotFound(id))
    }

    pub fn list_all(&self) -> Vec<OneTimeKey> {
        self.state().keys.values().cloned().collect()
    }

    pub fn mark_orphaned(&mut self, id: KeyId, since_ms: u64) -> Result<(), ChatError> {
        let key = self
            .state_mut()
            .keys
            .get_mut(&id)
            .ok_or(ChatError::KeyNotFound(id))?;
        if key.orphaned_from.is_some() {
            return Err(ChatError::KeyAlreadyMarked(id));
        }
        key.orphaned_from = Some(since_ms);
        Ok(())
    }

    /// Close this scope. The outermost scope flushes the snapshot.
    pub fn end(mut self) -> Result<(), ChatError> {
        self.close()
    }

    fn close(&mut self) -> Result<(), ChatError> {
        self.open = false;
        let store = self.store;
        let state = self.state_mut();
        state.depth = state.depth.saturating_sub(1);
        if state.depth > 0 {
            return Ok(());
        }
        let keys = std::mem::take(&mut state.keys);
        store.flush(&keys)
    }
}

impl Drop for OneTimeKeyScope<'_> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if let Err(e) = self.close() {
            tracing::warn!(identity = %self.store.identity, error = %e, "one-time key flush failed");
        }
    }
}
