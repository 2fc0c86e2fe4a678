//! Ratchet message wire format.
//!
//! ```text
//! version(1) | type(1) | [handshake header] | counter(8 LE) | ciphertext
//! handshake header (prekey messages only):
//!   sender_identity_key_id(8) | receiver_identity_key_id(8)
//!   | long_term_key_id(8) | has_one_time(1) | [one_time_key_id(8)]
//!   | ephemeral_key(32)
//! ```
//!
//! Everything before the ciphertext is authenticated as AEAD associated data.

use crate::error::CryptoError;
use crate::provider::{KeyId, KEY_ID_LEN};

const VERSION: u8 = 1;
const TYPE_PREKEY: u8 = 1;
const TYPE_REGULAR: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// First messages of a session; carry the handshake header.
    PreKey,
    Regular,
}

/// Key references a responder needs to locate its private prekeys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeHeader {
    pub sender_identity_key_id: KeyId,
    pub receiver_identity_key_id: KeyId,
    pub long_term_key_id: KeyId,
    pub one_time_key_id: Option<KeyId>,
    pub ephemeral_key: [u8; 32],
}

impl HandshakeHeader {
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.sender_identity_key_id.as_bytes());
        out.extend_from_slice(self.receiver_identity_key_id.as_bytes());
        out.extend_from_slice(self.long_term_key_id.as_bytes());
        match self.one_time_key_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(id.as_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.ephemeral_key);
    }

    pub(crate) fn read_from(reader: &mut Reader<'_>) -> Result<Self, CryptoError> {
        let sender_identity_key_id = reader.key_id()?;
        let receiver_identity_key_id = reader.key_id()?;
        let long_term_key_id = reader.key_id()?;
        let one_time_key_id = match reader.u8()? {
            0 => None,
            1 => Some(reader.key_id()?),
            flag => return Err(reader.error(format!("bad one-time key flag {flag}"))),
        };
        Ok(Self {
            sender_identity_key_id,
            receiver_identity_key_id,
            long_term_key_id,
            one_time_key_id,
            ephemeral_key: reader.array()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    pub(crate) handshake: Option<HandshakeHeader>,
    pub(crate) counter: u64,
    pub(crate) ciphertext: Vec<u8>,
}

impl RatchetMessage {
    pub fn message_type(&self) -> MessageType {
        if self.handshake.is_some() {
            MessageType::PreKey
        } else {
            MessageType::Regular
        }
    }

    pub fn handshake(&self) -> Option<&HandshakeHeader> {
        self.handshake.as_ref()
    }

    pub fn sender_identity_key_id(&self) -> Option<KeyId> {
        self.handshake.as_ref().map(|h| h.sender_identity_key_id)
    }

    pub fn receiver_identity_key_id(&self) -> Option<KeyId> {
        self.handshake.as_ref().map(|h| h.receiver_identity_key_id)
    }

    pub fn long_term_key_id(&self) -> Option<KeyId> {
        self.handshake.as_ref().map(|h| h.long_term_key_id)
    }

    pub fn one_time_key_id(&self) -> Option<KeyId> {
        self.handshake.as_ref().and_then(|h| h.one_time_key_id)
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Encoded bytes preceding the ciphertext.
    pub(crate) fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 65 + 8);
        out.push(VERSION);
        match &self.handshake {
            Some(h) => {
                out.push(TYPE_PREKEY);
                h.write_to(&mut out);
            }
            None => out.push(TYPE_REGULAR),
        }
        out.extend_from_slice(&self.counter.to_le_bytes());
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.header_bytes();
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = Reader::new(data, CryptoError::InvalidMessage);

        let version = reader.u8()?;
        if version != VERSION {
            return Err(CryptoError::InvalidMessage(format!("unsupported version {version}")));
        }

        let handshake = match reader.u8()? {
            TYPE_PREKEY => Some(HandshakeHeader::read_from(&mut reader)?),
            TYPE_REGULAR => None,
            other => return Err(CryptoError::InvalidMessage(format!("unknown type {other}"))),
        };

        let counter = reader.u64()?;
        Ok(Self {
            handshake,
            counter,
            ciphertext: reader.rest().to_vec(),
        })
    }
}

/// Bounds-checked cursor shared by the message and state decoders.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    error: fn(String) -> CryptoError,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8], error: fn(String) -> CryptoError) -> Self {
        Self { data, pos: 0, error }
    }

    pub(crate) fn error(&self, message: String) -> CryptoError {
        (self.error)(message)
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], CryptoError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| (self.error)(format!("truncated at byte {}", self.pos)))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], CryptoError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CryptoError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u64(&mut self) -> Result<u64, CryptoError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn key_id(&mut self) -> Result<KeyId, CryptoError> {
        Ok(KeyId::from(self.array::<KEY_ID_LEN>()?))
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }
}
