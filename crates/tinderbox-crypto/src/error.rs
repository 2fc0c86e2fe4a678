use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signing failed: {0}")]
    SigningError(String),

    #[error("verification failed: {0}")]
    VerificationError(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("decryption failed: {0}")]
    DecryptionError(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("malformed ratchet message: {0}")]
    InvalidMessage(String),

    #[error("corrupt ratchet state: {0}")]
    InvalidState(String),

    #[error("credential storage error: {0}")]
    StorageError(String),
}

impl From<std::io::Error> for CryptoError {
    fn from(err: std::io::Error) -> Self {
        Self::StorageError(err.to_string())
    }
}
