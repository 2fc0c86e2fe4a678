//! tinderbox-chat: prekey lifecycle and session establishment.
//!
//! A [`SecureChat`] owns one local identity's one-time and long-term prekey
//! stores, keeps them in step with the key directory through periodic
//! rotation, and opens ratchet sessions with peers as sender or receiver.

pub mod chat;
pub mod clock;
pub mod config;
pub mod context;
pub mod distribution;
pub mod error;
mod establish;
pub mod keys;
pub mod rotation;
pub mod session;
pub mod storage;
#[cfg(test)]
mod testing;

pub use chat::{RotationOutcome, SecureChat};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ChatConfig;
pub use context::ChatContext;
pub use distribution::{
    DirectoryClient, DistributionError, InMemoryDirectory, KeyDistributionService, ValidationResult,
};
pub use error::ChatError;
pub use keys::{IdentityPublicKeySet, LongTermKey, OneTimeKey, Participant, PublicKeySet, SignedPublicKey};
pub use rotation::{KeysRotator, RotationLog};
pub use session::SecureSession;
pub use storage::{LongTermKeyStore, OneTimeKeyScope, OneTimeKeyStore, SessionStore, DEFAULT_SESSION_NAME};
