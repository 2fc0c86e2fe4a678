//! Session establishment: X3DH initiator and responder paths, plus the
//! background replenishment of consumed one-time keys.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tinderbox_crypto::{MessageType, RatchetMessage};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::context::Shared;
use crate::error::ChatError;
use crate::keys::{Participant, PublicKeySet};
use crate::rotation::generate_one_time_keys;
use crate::session::SecureSession;

pub(crate) struct SessionEstablisher {
    shared: Arc<Shared>,
    replenisher: Replenisher,
}

impl SessionEstablisher {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            replenisher: Replenisher::new(Arc::clone(&shared)),
            shared,
        }
    }

    pub(crate) fn replenisher(&self) -> &Replenisher {
        &self.replenisher
    }

    pub(crate) async fn start_as_sender(&self, participant: &Participant, name: &str) -> Result<SecureSession, ChatError> {
        self.ensure_no_session(&participant.identity, name)?;
        let key_set = self
            .shared
            .directory
            .get_public_key_set(&participant.identity)
            .await?;
        self.initiate(participant, name, &key_set)
    }

    /// Open sessions with every participant, or with none of them.
    pub(crate) async fn start_multiple_as_sender(
        &self,
        participants: &[Participant],
        name: &str,
    ) -> Result<Vec<SecureSession>, ChatError> {
        let mut seen = HashSet::new();
        for participant in participants {
            if !seen.insert(participant.identity.as_str()) {
                return Err(ChatError::DuplicateParticipant(participant.identity.clone()));
            }
        }
        for participant in participants {
            self.ensure_no_session(&participant.identity, name)?;
        }

        let identities: Vec<String> = participants.iter().map(|p| p.identity.clone()).collect();
        let key_sets = self
            .shared
            .directory
            .get_multiple_public_key_sets(&identities)
            .await?;
        let mismatch = || ChatError::PublicKeySetsMismatch {
            requested: participants.len(),
            received: key_sets.len(),
        };
        if key_sets.len() != participants.len() {
            return Err(mismatch());
        }

        participants
            .iter()
            .map(|participant| {
                let key_set = key_sets
                    .iter()
                    .find(|set| set.identity == participant.identity)
                    .ok_or_else(mismatch)?;
                self.initiate(participant, name, &key_set.key_set)
            })
            .collect()
    }

    pub(crate) async fn start_as_receiver(
        &self,
        participant: &Participant,
        message: &RatchetMessage,
        name: &str,
    ) -> Result<SecureSession, ChatError> {
        let shared = &self.shared;
        self.ensure_no_session(&participant.identity, name)?;

        let header = match (message.message_type(), message.handshake()) {
            (MessageType::PreKey, Some(header)) => header,
            _ => return Err(ChatError::InvalidMessageType),
        };
        let peer_key_id = shared.crypto.key_id(&participant.identity_public_key);
        if header.sender_identity_key_id != peer_key_id || header.receiver_identity_key_id != shared.identity_key_id {
            return Err(ChatError::IdentityKeyMismatch);
        }

        let long_term = shared.long_term_keys.retrieve(header.long_term_key_id)?;
        let one_time = match header.one_time_key_id {
            Some(id) => {
                let mut scope = shared.one_time_keys.begin_scope().await?;
                let consumed = scope.retrieve(id).and_then(|key| {
                    scope.delete(id)?;
                    Ok(key)
                });
                scope.end()?;
                let key = consumed?;
                tracing::debug!(key_id = %id, "one-time key consumed by handshake");
                self.replenisher.schedule(1);
                Some(key)
            }
            None => None,
        };

        let state = shared.ratchet.respond(
            &participant.identity_public_key,
            &shared.identity_key,
            &long_term.key_material,
            one_time.as_ref().map(|key| key.key_material.as_slice()),
            message,
        )?;
        tracing::info!(
            participant = %participant.identity,
            session = name,
            one_time_key = one_time.is_some(),
            "session started as receiver"
        );
        Ok(SecureSession::new(
            participant.identity.clone(),
            name,
            Arc::clone(&shared.ratchet),
            state,
        ))
    }

    fn ensure_no_session(&self, participant: &str, name: &str) -> Result<(), ChatError> {
        if self.shared.sessions.session_exists(participant, name)? {
            return Err(ChatError::SessionAlreadyExists {
                participant: participant.to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn initiate(&self, participant: &Participant, name: &str, key_set: &PublicKeySet) -> Result<SecureSession, ChatError> {
        let shared = &self.shared;
        if !key_set
            .long_term_public_key
            .verify(shared.crypto.as_ref(), &participant.identity_public_key)
        {
            return Err(ChatError::InvalidLongTermKeySignature);
        }
        if key_set.one_time_public_key.is_none() {
            tracing::warn!(
                participant = %participant.identity,
                "peer has no one-time keys left, session starts without one"
            );
        }

        let state = shared.ratchet.initiate(
            &shared.identity_key,
            &participant.identity_public_key,
            &key_set.long_term_public_key.public_key,
            key_set.one_time_public_key.as_deref(),
        )?;
        tracing::info!(participant = %participant.identity, session = name, "session started as sender");
        Ok(SecureSession::new(
            participant.identity.clone(),
            name,
            Arc::clone(&shared.ratchet),
            state,
        ))
    }
}

#[derive(Default)]
struct ReplenishState {
    pending: usize,
    task: Option<JoinHandle<()>>,
}

/// Debounced upload of replacement one-time keys.
///
/// Consumptions that arrive while a task is waiting are folded into its
/// batch. The batch tops the pool up to `desired_one_time_keys` as seen when
/// it runs, so keys a rotation added in the meantime are not duplicated.
/// A failed batch is dropped; the next rotation covers the deficit.
pub(crate) struct Replenisher {
    shared: Arc<Shared>,
    state: Arc<Mutex<ReplenishState>>,
    busy: Arc<watch::Sender<bool>>,
}

impl Replenisher {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            state: Arc::new(Mutex::new(ReplenishState::default())),
            busy: Arc::new(watch::channel(false).0),
        }
    }

    pub(crate) fn schedule(&self, count: usize) {
        let mut state = self.state.lock();
        state.pending += count;
        if state.task.is_some() {
            return;
        }

        self.busy.send_replace(true);
        let shared = Arc::clone(&self.shared);
        let task_state = Arc::clone(&self.state);
        let busy = Arc::clone(&self.busy);
        state.task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(shared.config.replenish_debounce()).await;
                let consumed = std::mem::take(&mut task_state.lock().pending);
                if let Err(e) = replenish(&shared).await {
                    tracing::warn!(error = %e, consumed, "one-time key replenishment failed");
                }

                let mut state = task_state.lock();
                if state.pending == 0 {
                    state.task = None;
                    busy.send_replace(false);
                    return;
                }
            }
        }));
    }

    /// Wait until no replenishment is pending or running.
    pub(crate) async fn flush(&self) {
        let mut busy = self.busy.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = busy.wait_for(|busy| !*busy).await;
    }

    /// Abort a pending replenishment and drop its batch.
    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock();
        if let Some(task) = state.task.take() {
            task.abort();
            tracing::debug!(dropped = state.pending, "pending replenishment cancelled");
        }
        state.pending = 0;
        self.busy.send_replace(false);
    }
}

async fn replenish(shared: &Shared) -> Result<(), ChatError> {
    let mut scope = shared.one_time_keys.begin_scope().await?;
    let active = scope.list_all().iter().filter(|key| !key.is_orphaned()).count();
    let count = shared.config.desired_one_time_keys.saturating_sub(active);
    if count == 0 {
        scope.end()?;
        tracing::debug!(active, "one-time key pool already full");
        return Ok(());
    }
    let generated = generate_one_time_keys(shared, &mut scope, count);
    scope.end()?;
    let public_keys = generated?;

    shared.directory.upload_public_keys(None, None, &public_keys).await?;
    tracing::debug!(count, "one-time keys replenished");
    Ok(())
}
