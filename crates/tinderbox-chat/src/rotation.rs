//! Prekey rotation: ages out local keys, reconciles them with the directory
//! and republishes what is missing.

use std::fmt;
use std::sync::Arc;

use tinderbox_crypto::KeyId;
use tokio::sync::Mutex;

use crate::clock::expired;
use crate::context::Shared;
use crate::error::ChatError;
use crate::keys::{LongTermKey, SignedPublicKey};
use crate::storage::OneTimeKeyScope;

/// Counters from one rotation run.
///
/// `*_relevant` counts the keys that are live after the run (kept plus
/// added). `one_time_keys_orphaned` and `long_term_keys_outdated` count the
/// keys kept in their grace period after the run, including the ones marked
/// during it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationLog {
    pub one_time_keys_relevant: usize,
    pub one_time_keys_added: usize,
    pub one_time_keys_deleted: usize,
    pub one_time_keys_marked_orphaned: usize,
    pub one_time_keys_orphaned: usize,
    pub long_term_keys_relevant: usize,
    pub long_term_keys_added: usize,
    pub long_term_keys_deleted: usize,
    pub long_term_keys_marked_outdated: usize,
    pub long_term_keys_outdated: usize,
}

impl fmt::Display for RotationLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "one-time keys: {} relevant, {} added, {} deleted, {} marked orphaned, {} orphaned; \
             long-term keys: {} relevant, {} added, {} deleted, {} marked outdated, {} outdated",
            self.one_time_keys_relevant,
            self.one_time_keys_added,
            self.one_time_keys_deleted,
            self.one_time_keys_marked_orphaned,
            self.one_time_keys_orphaned,
            self.long_term_keys_relevant,
            self.long_term_keys_added,
            self.long_term_keys_deleted,
            self.long_term_keys_marked_outdated,
            self.long_term_keys_outdated,
        )
    }
}

/// Runs rotations for one identity, at most one at a time.
pub struct KeysRotator {
    shared: Arc<Shared>,
    in_flight: Mutex<()>,
}

impl KeysRotator {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            in_flight: Mutex::new(()),
        }
    }

    /// Rotate keys. Fails with [`ChatError::ConcurrentRotation`] instead of
    /// waiting when another rotation is running.
    ///
    /// Local changes made before a failure are still flushed, so local state
    /// may run ahead of the directory until the next successful run.
    pub async fn rotate(&self) -> Result<RotationLog, ChatError> {
        let Ok(_in_flight) = self.in_flight.try_lock() else {
            return Err(ChatError::ConcurrentRotation);
        };

        let mut scope = self.shared.one_time_keys.begin_scope().await?;
        let outcome = self.rotate_in_scope(&mut scope).await;
        let flushed = scope.end();

        let log = outcome?;
        flushed?;
        tracing::info!(identity = %self.shared.identity, %log, "keys rotated");
        Ok(log)
    }

    async fn rotate_in_scope(&self, scope: &mut OneTimeKeyScope<'_>) -> Result<RotationLog, ChatError> {
        let shared = &self.shared;
        let config = &shared.config;
        let now = shared.clock.now_ms();
        let mut log = RotationLog::default();

        let mut active: Vec<KeyId> = Vec::new();
        for key in scope.list_all() {
            match key.orphaned_from {
                Some(since) if expired(since, config.orphaned_one_time_key_ttl(), now) => {
                    scope.delete(key.id)?;
                    log.one_time_keys_deleted += 1;
                    tracing::debug!(key_id = %key.id, "orphaned one-time key deleted");
                }
                Some(_) => log.one_time_keys_orphaned += 1,
                None => active.push(key.id),
            }
        }

        let current = self.age_long_term_keys(now, &mut log)?;

        let validation = shared
            .directory
            .validate_public_keys(current.as_ref().map(|key| key.id), &active)
            .await?;

        let mut used = 0;
        for id in &validation.used_one_time_key_ids {
            let Some(position) = active.iter().position(|active_id| active_id == id) else {
                tracing::warn!(key_id = %id, "directory reported an unknown one-time key as used");
                continue;
            };
            active.swap_remove(position);
            scope.mark_orphaned(*id, now)?;
            used += 1;
            tracing::debug!(key_id = %id, "one-time key marked orphaned");
        }
        log.one_time_keys_marked_orphaned = used;
        log.one_time_keys_orphaned += used;

        let current_used = matches!(
            (&current, validation.used_long_term_key_id),
            (Some(key), Some(used_id)) if key.id == used_id
        );
        if let (Some(key), true) = (&current, current_used) {
            shared.long_term_keys.mark_outdated(key.id, now)?;
            log.long_term_keys_marked_outdated += 1;
            log.long_term_keys_outdated += 1;
            tracing::debug!(key_id = %key.id, "long-term key reported used, marked outdated");
        }

        let staged_long_term = if current.is_none() || current_used {
            Some(self.generate_long_term_key()?)
        } else {
            None
        };
        log.long_term_keys_added = usize::from(staged_long_term.is_some());
        log.long_term_keys_relevant = 1;

        let remaining = active.len();
        let deficit = config.desired_one_time_keys.saturating_sub(remaining);
        let staged_one_time = generate_one_time_keys(shared, scope, deficit)?;
        log.one_time_keys_added = deficit;
        log.one_time_keys_relevant = remaining + deficit;

        if staged_long_term.is_some() || !staged_one_time.is_empty() {
            let card_id = staged_long_term.as_ref().map(|_| shared.identity_card_id.as_str());
            shared
                .directory
                .upload_public_keys(card_id, staged_long_term.as_ref(), &staged_one_time)
                .await?;
            tracing::debug!(
                long_term = staged_long_term.is_some(),
                one_time = staged_one_time.len(),
                "rotated keys uploaded"
            );
        }

        Ok(log)
    }

    /// Delete expired outdated keys, outdate expired or superseded current
    /// keys, and return the newest remaining current key.
    fn age_long_term_keys(&self, now: u64, log: &mut RotationLog) -> Result<Option<LongTermKey>, ChatError> {
        let store = &self.shared.long_term_keys;
        let config = &self.shared.config;
        let mut current: Option<LongTermKey> = None;

        // Oldest first, so the last current key seen is the newest.
        for key in store.list_all()? {
            match key.outdated_from {
                Some(since) if expired(since, config.outdated_long_term_key_ttl(), now) => {
                    store.delete(key.id)?;
                    log.long_term_keys_deleted += 1;
                    tracing::debug!(key_id = %key.id, "outdated long-term key deleted");
                }
                Some(_) => log.long_term_keys_outdated += 1,
                None => {
                    let superseded = if expired(key.creation_date, config.long_term_key_ttl(), now) {
                        Some(key)
                    } else {
                        current.replace(key)
                    };
                    if let Some(old) = superseded {
                        store.mark_outdated(old.id, now)?;
                        log.long_term_keys_marked_outdated += 1;
                        log.long_term_keys_outdated += 1;
                        tracing::debug!(key_id = %old.id, "long-term key marked outdated");
                    }
                }
            }
        }
        Ok(current)
    }

    fn generate_long_term_key(&self) -> Result<SignedPublicKey, ChatError> {
        let shared = &self.shared;
        let pair = shared.crypto.generate_key_pair();
        let id = shared.crypto.key_id(&pair.public_key);
        shared.long_term_keys.store(&pair.private_key[..], id)?;
        tracing::debug!(key_id = %id, "long-term key generated");
        Ok(SignedPublicKey {
            public_key: pair.public_key.to_vec(),
            signature: shared.crypto.sign(&shared.identity_key, &pair.public_key),
        })
    }
}

/// Generate `count` one-time keys into `scope`, returning their public halves.
pub(crate) fn generate_one_time_keys(
    shared: &Shared,
    scope: &mut OneTimeKeyScope<'_>,
    count: usize,
) -> Result<Vec<Vec<u8>>, ChatError> {
    let mut public_keys = Vec::with_capacity(count);
    for _ in 0..count {
        let pair = shared.crypto.generate_key_pair();
        let id = shared.crypto.key_id(&pair.public_key);
        scope.store(&pair.private_key[..], id)?;
        public_keys.push(pair.public_key.to_vec());
    }
    Ok(public_keys)
}
