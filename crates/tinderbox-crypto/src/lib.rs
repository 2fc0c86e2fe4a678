//! tinderbox-crypto: key material primitives for Tinderbox.
//!
//! Holds the Ed25519 identity, the crypto provider used to mint prekeys and
//! fingerprint them, the credential stores private keys are persisted in,
//! and the ratchet engine that turns prekeys into a message session.

pub mod credential;
pub mod error;
pub mod identity;
pub mod provider;
pub mod ratchet;

pub use credential::{
    CredentialStore, FileCredentialStore, MemoryCredentialStore, SealedCredentialStore,
};
pub use error::CryptoError;
pub use identity::Identity;
pub use provider::{CryptoProvider, DalekCrypto, KeyId, KeyPair};
pub use ratchet::{
    HandshakeHeader, MessageType, RatchetEngine, RatchetMessage, RatchetState, X3dhRatchet,
};
