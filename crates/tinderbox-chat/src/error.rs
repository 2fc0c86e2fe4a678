use thiserror::Error;
use tinderbox_crypto::{CryptoError, KeyId};

use crate::distribution::DistributionError;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("key not found: {0}")]
    KeyNotFound(KeyId),

    #[error("key already exists: {0}")]
    KeyAlreadyExists(KeyId),

    #[error("key already marked: {0}")]
    KeyAlreadyMarked(KeyId),

    #[error("conflicting key state: {0}")]
    Conflict(String),

    #[error("a key rotation is already in progress")]
    ConcurrentRotation,

    #[error("session already exists with {participant} ({name})")]
    SessionAlreadyExists { participant: String, name: String },

    #[error("session not found with {participant} ({name})")]
    SessionNotFound { participant: String, name: String },

    #[error("long-term key signature is invalid")]
    InvalidLongTermKeySignature,

    #[error("expected an initial (prekey) message")]
    InvalidMessageType,

    #[error("identity key id in handshake does not match")]
    IdentityKeyMismatch,

    #[error("participant listed more than once: {0}")]
    DuplicateParticipant(String),

    #[error("requested {requested} public key sets, received {received}")]
    PublicKeySetsMismatch { requested: usize, received: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Distribution(#[from] DistributionError),
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collaborator_errors_pass_through_unchanged() {
        let crypto = CryptoError::DecryptionError("bad tag".into());
        let expected = crypto.to_string();
        assert_eq!(ChatError::from(crypto).to_string(), expected);

        let remote = DistributionError::UnknownIdentity("bob".into());
        let expected = remote.to_string();
        assert_eq!(ChatError::from(remote).to_string(), expected);
    }

    #[test]
    fn session_errors_name_participant() {
        let err = ChatError::SessionAlreadyExists {
            participant: "bob".into(),
            name: "default".into(),
        };
        assert_eq!(err.to_string(), "session already exists with bob (default)");
    }
}
