//! Ratchet engine boundary.
//!
//! The chat layer treats session state as opaque bytes and only ever talks to
//! a [`RatchetEngine`]. [`X3dhRatchet`] is the production engine.

mod message;
mod x3dh;

pub use message::{HandshakeHeader, MessageType, RatchetMessage};
pub use x3dh::X3dhRatchet;

use std::fmt;

use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::Identity;

/// Opaque session state. Only the engine that produced it can interpret it.
#[derive(Clone)]
pub struct RatchetState(Zeroizing<Vec<u8>>);

impl RatchetState {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RatchetState({} bytes)", self.0.len())
    }
}

/// Key agreement and per-message encryption for one-to-one sessions.
pub trait RatchetEngine: Send + Sync {
    /// Initiator side of the handshake.
    fn initiate(
        &self,
        own_identity: &Identity,
        peer_identity_public_key: &[u8],
        peer_long_term_public_key: &[u8],
        peer_one_time_public_key: Option<&[u8]>,
    ) -> Result<RatchetState, CryptoError>;

    /// Responder side of the handshake, driven by the peer's first message.
    fn respond(
        &self,
        peer_identity_public_key: &[u8],
        own_identity: &Identity,
        own_long_term_private_key: &[u8],
        own_one_time_private_key: Option<&[u8]>,
        handshake: &RatchetMessage,
    ) -> Result<RatchetState, CryptoError>;

    /// Encrypt `plaintext`, advancing `state` only on success.
    fn encrypt(&self, state: &mut RatchetState, plaintext: &[u8]) -> Result<RatchetMessage, CryptoError>;

    /// Decrypt `message`, advancing `state` only on success.
    fn decrypt(&self, state: &mut RatchetState, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError>;

    fn serialize(&self, state: &RatchetState) -> Vec<u8>;

    fn deserialize(&self, data: &[u8]) -> Result<RatchetState, CryptoError>;

    fn parse_message(&self, data: &[u8]) -> Result<RatchetMessage, CryptoError>;
}
