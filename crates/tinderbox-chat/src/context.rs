use std::sync::Arc;

use tinderbox_crypto::{CredentialStore, CryptoProvider, Identity, KeyId, RatchetEngine};

use crate::clock::Clock;
use crate::config::ChatConfig;
use crate::distribution::KeyDistributionService;
use crate::error::ChatError;
use crate::storage::{LongTermKeyStore, OneTimeKeyStore, SessionStore};

/// Everything a [`SecureChat`](crate::SecureChat) needs for one local identity.
pub struct ChatContext {
    /// Name the identity is published under in the directory.
    pub identity: String,
    /// Identity card the directory binds long-term keys to.
    pub identity_card_id: String,
    pub identity_key: Identity,
    pub crypto: Arc<dyn CryptoProvider>,
    pub credentials: Arc<dyn CredentialStore>,
    pub directory: Arc<dyn KeyDistributionService>,
    pub ratchet: Arc<dyn RatchetEngine>,
    pub clock: Arc<dyn Clock>,
    pub config: ChatConfig,
}

/// Per-identity state shared by the rotation engine, session establishment
/// and the facade.
pub(crate) struct Shared {
    pub identity: String,
    pub identity_card_id: String,
    pub identity_key: Identity,
    pub identity_key_id: KeyId,
    pub crypto: Arc<dyn CryptoProvider>,
    pub directory: Arc<dyn KeyDistributionService>,
    pub ratchet: Arc<dyn RatchetEngine>,
    pub clock: Arc<dyn Clock>,
    pub config: ChatConfig,
    pub one_time_keys: OneTimeKeyStore,
    pub long_term_keys: LongTermKeyStore,
    pub sessions: Arc<SessionStore>,
}

impl Shared {
    pub fn new(context: ChatContext) -> Result<Self, ChatError> {
        context.config.validate()?;
        let ChatContext {
            identity,
            identity_card_id,
            identity_key,
            crypto,
            credentials,
            directory,
            ratchet,
            clock,
            config,
        } = context;

        Ok(Self {
            identity_key_id: crypto.key_id(&identity_key.public_key_bytes()),
            one_time_keys: OneTimeKeyStore::new(identity.clone(), credentials.clone()),
            long_term_keys: LongTermKeyStore::new(identity.clone(), credentials.clone(), clock.clone()),
            sessions: Arc::new(SessionStore::new(identity.clone(), credentials)),
            identity,
            identity_card_id,
            identity_key,
            crypto,
            directory,
            ratchet,
            clock,
            config,
        })
    }
}
