//! Per-identity entry point tying the stores, rotation and session
//! establishment together.

use std::sync::Arc;

use tinderbox_crypto::RatchetMessage;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ChatConfig;
use crate::context::{ChatContext, Shared};
use crate::error::ChatError;
use crate::establish::SessionEstablisher;
use crate::keys::Participant;
use crate::rotation::{KeysRotator, RotationLog};
use crate::session::SecureSession;
use crate::storage::DEFAULT_SESSION_NAME;

/// Latest outcome published by [`SecureChat::spawn_rotation_loop`].
pub type RotationOutcome = Option<Result<RotationLog, Arc<ChatError>>>;

pub struct SecureChat {
    shared: Arc<Shared>,
    rotator: Arc<KeysRotator>,
    establisher: SessionEstablisher,
}

impl SecureChat {
    pub fn new(context: ChatContext) -> Result<Self, ChatError> {
        let shared = Arc::new(Shared::new(context)?);
        tracing::debug!(identity = %shared.identity, "secure chat created");
        Ok(Self {
            rotator: Arc::new(KeysRotator::new(Arc::clone(&shared))),
            establisher: SessionEstablisher::new(Arc::clone(&shared)),
            shared,
        })
    }

    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    pub fn config(&self) -> &ChatConfig {
        &self.shared.config
    }

    /// How peers address this identity when opening sessions.
    pub fn participant(&self) -> Participant {
        Participant::new(
            self.shared.identity.clone(),
            self.shared.identity_key.public_key_bytes(),
        )
    }

    pub async fn rotate_keys(&self) -> Result<RotationLog, ChatError> {
        self.rotator.rotate().await
    }

    /// Rotate now and then every `rotation_interval`, publishing outcomes.
    ///
    /// Runs until the handle is aborted. Runs that lose to a concurrent
    /// rotation are skipped.
    pub fn spawn_rotation_loop(&self) -> (JoinHandle<()>, watch::Receiver<RotationOutcome>) {
        let (tx, rx) = watch::channel(None);
        let rotator = Arc::clone(&self.rotator);
        let interval = self.shared.config.rotation_interval();
        let identity = self.shared.identity.clone();

        let handle = tokio::spawn(async move {
            loop {
                match rotator.rotate().await {
                    Ok(log) => {
                        let _ = tx.send(Some(Ok(log)));
                    }
                    Err(ChatError::ConcurrentRotation) => {
                        tracing::debug!(%identity, "scheduled rotation skipped, another one is running");
                    }
                    Err(e) => {
                        tracing::warn!(%identity, error = %e, "scheduled rotation failed");
                        let _ = tx.send(Some(Err(Arc::new(e))));
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });

        (handle, rx)
    }

    /// Persist `session` and keep writing its state through on every
    /// encrypt and decrypt.
    pub async fn store_session(&self, session: &SecureSession) -> Result<(), ChatError> {
        session.persist_to(&self.shared.sessions).await
    }

    pub fn existing_session(&self, participant: &str, name: Option<&str>) -> Result<Option<SecureSession>, ChatError> {
        let name = name.unwrap_or(DEFAULT_SESSION_NAME);
        let Some((data, binding)) = self.shared.sessions.retrieve_bound(participant, name)? else {
            return Ok(None);
        };
        let state = self.shared.ratchet.deserialize(&data)?;
        Ok(Some(SecureSession::restored(
            participant,
            name,
            Arc::clone(&self.shared.ratchet),
            state,
            Arc::clone(&self.shared.sessions),
            binding,
        )))
    }

    pub fn delete_session(&self, participant: &str, name: Option<&str>) -> Result<(), ChatError> {
        self.shared
            .sessions
            .delete_session(participant, name.unwrap_or(DEFAULT_SESSION_NAME))
    }

    pub fn delete_all_sessions_with(&self, participant: &str) -> Result<(), ChatError> {
        self.shared.sessions.delete_all_sessions(participant)
    }

    /// Open a session with `participant` from its published prekeys. The
    /// session is not stored until [`store_session`](Self::store_session).
    pub async fn start_as_sender(&self, participant: &Participant, name: Option<&str>) -> Result<SecureSession, ChatError> {
        self.establisher
            .start_as_sender(participant, name.unwrap_or(DEFAULT_SESSION_NAME))
            .await
    }

    pub async fn start_multiple_as_sender(
        &self,
        participants: &[Participant],
        name: Option<&str>,
    ) -> Result<Vec<SecureSession>, ChatError> {
        self.establisher
            .start_multiple_as_sender(participants, name.unwrap_or(DEFAULT_SESSION_NAME))
            .await
    }

    /// Accept a session from the first message `participant` sent. The
    /// message still has to be decrypted with the returned session.
    pub async fn start_as_receiver(
        &self,
        participant: &Participant,
        message: &RatchetMessage,
        name: Option<&str>,
    ) -> Result<SecureSession, ChatError> {
        self.establisher
            .start_as_receiver(participant, message, name.unwrap_or(DEFAULT_SESSION_NAME))
            .await
    }

    /// Wait for pending one-time key replenishment to finish.
    pub async fn flush_replenishment(&self) {
        self.establisher.replenisher().flush().await;
    }

    /// Erase the directory entry, both key stores and every session.
    ///
    /// Each part is attempted even when an earlier one fails, and each is a
    /// no-op when already empty, so a failed reset can simply be retried.
    /// Returns the first error.
    pub async fn reset(&self) -> Result<(), ChatError> {
        let shared = &self.shared;
        self.establisher.replenisher().cancel();

        let results = [
            ("directory", shared.directory.delete_keys_entity().await.map_err(ChatError::from)),
            ("one-time keys", shared.one_time_keys.reset().await),
            ("long-term keys", shared.long_term_keys.reset()),
            ("sessions", shared.sessions.reset()),
        ];

        let mut first_error = None;
        for (part, result) in results {
            if let Err(e) = result {
                tracing::warn!(identity = %shared.identity, part, error = %e, "reset step failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(identity = %shared.identity, "identity reset");
                Ok(())
            }
        }
    }
}
