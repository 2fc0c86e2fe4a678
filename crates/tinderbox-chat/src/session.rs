use std::fmt;
use std::sync::Arc;

use tinderbox_crypto::{RatchetEngine, RatchetMessage, RatchetState};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::error::ChatError;
use crate::storage::{SessionBinding, SessionStore};

struct SessionInner {
    participant: String,
    name: String,
    engine: Arc<dyn RatchetEngine>,
    store: parking_lot::Mutex<Option<(Arc<SessionStore>, SessionBinding)>>,
    state: Mutex<RatchetState>,
}

/// An established ratchet session with one participant.
///
/// Clones share the same state. Encrypt and decrypt calls are serialized per
/// session; each advances a copy of the ratchet, persists it when the session
/// has been stored, and only then commits the copy. A failed write leaves the
/// session where it was.
///
/// Once the stored entry is deleted or the store reset, writes fail with
/// [`ChatError::SessionNotFound`] until the session is stored again.
#[derive(Clone)]
pub struct SecureSession {
    inner: Arc<SessionInner>,
}

impl SecureSession {
    pub(crate) fn new(
        participant: impl Into<String>,
        name: impl Into<String>,
        engine: Arc<dyn RatchetEngine>,
        state: RatchetState,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                participant: participant.into(),
                name: name.into(),
                engine,
                store: parking_lot::Mutex::new(None),
                state: Mutex::new(state),
            }),
        }
    }

    /// A session loaded from `store`, already bound to it.
    pub(crate) fn restored(
        participant: impl Into<String>,
        name: impl Into<String>,
        engine: Arc<dyn RatchetEngine>,
        state: RatchetState,
        store: Arc<SessionStore>,
        binding: SessionBinding,
    ) -> Self {
        let session = Self::new(participant, name, engine, state);
        *session.inner.store.lock() = Some((store, binding));
        session
    }

    pub fn participant_identity(&self) -> &str {
        &self.inner.participant
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether state changes are written through to a session store.
    pub fn is_persistent(&self) -> bool {
        self.inner.store.lock().is_some()
    }

    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<RatchetMessage, ChatError> {
        let mut state = self.inner.state.lock().await;
        let mut next = state.clone();
        let message = self.inner.engine.encrypt(&mut next, plaintext)?;
        self.write(&next)?;
        *state = next;
        Ok(message)
    }

    pub async fn encrypt_string(&self, plaintext: &str) -> Result<RatchetMessage, ChatError> {
        self.encrypt(plaintext.as_bytes()).await
    }

    pub async fn decrypt(&self, message: &RatchetMessage) -> Result<Vec<u8>, ChatError> {
        let mut state = self.inner.state.lock().await;
        let mut next = state.clone();
        let plaintext = self.inner.engine.decrypt(&mut next, message)?;
        self.write(&next)?;
        *state = next;
        Ok(plaintext)
    }

    pub async fn decrypt_string(&self, message: &RatchetMessage) -> Result<String, ChatError> {
        let plaintext = self.decrypt(message).await?;
        String::from_utf8(plaintext).map_err(|e| ChatError::Serialization(e.to_string()))
    }

    /// Write the current state to `store` and keep writing through to it.
    pub(crate) async fn persist_to(&self, store: &Arc<SessionStore>) -> Result<(), ChatError> {
        let state = self.inner.state.lock().await;
        let data = Zeroizing::new(self.inner.engine.serialize(&state));
        let binding = store.store_bound(&self.inner.participant, &self.inner.name, &data)?;
        *self.inner.store.lock() = Some((Arc::clone(store), binding));
        Ok(())
    }

    fn write(&self, state: &RatchetState) -> Result<(), ChatError> {
        let bound = self.inner.store.lock();
        let Some((store, binding)) = bound.as_ref() else {
            return Ok(());
        };
        let data = Zeroizing::new(self.inner.engine.serialize(state));
        store.write_bound(binding, &self.inner.participant, &self.inner.name, &data)
    }
}

impl fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession")
            .field("participant", &self.inner.participant)
            .field("name", &self.inner.name)
            .field("persistent", &self.is_persistent())
            .finish_non_exhaustive()
    }
}
