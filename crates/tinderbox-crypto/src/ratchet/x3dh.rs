use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::message::{HandshakeHeader, RatchetMessage, Reader};
use super::{RatchetEngine, RatchetState};
use crate::error::CryptoError;
use crate::identity::Identity;
use crate::provider::CryptoProvider;

const X3DH_INFO: &[u8] = b"TinderboxX3DH";
const MESSAGE_KEY_INFO: &[u8] = b"TinderboxMsgKey";
const CHAIN_KEY_INFO: &[u8] = b"TinderboxChainKey";
const STATE_VERSION: u8 = 1;

/// Largest forward jump in receive counters we derive keys across.
const MAX_SKIP: u64 = 1000;
/// Retained keys for messages that have not arrived yet; oldest dropped first.
const MAX_SKIPPED_KEYS: usize = 2000;

/// X3DH key agreement feeding symmetric sending/receiving chains.
///
/// The initiator performs DH1 = DH(IK_A, LTK_B), DH2 = DH(EK_A, IK_B),
/// DH3 = DH(EK_A, LTK_B) and, when the peer published one, DH4 = DH(EK_A, OTK_B).
/// HKDF-SHA256 over the concatenation yields one chain key per direction.
/// Each message key is derived from its chain and used once with AES-256-GCM;
/// the encoded message header is bound as associated data.
///
/// Until the initiator decrypts its first reply it keeps attaching the
/// handshake header, so the responder can bootstrap from whichever of the
/// early messages reaches it first.
pub struct X3dhRatchet {
    crypto: Arc<dyn CryptoProvider>,
}

impl X3dhRatchet {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self { crypto }
    }
}

#[derive(Clone, Zeroize)]
struct SkippedKey {
    counter: u64,
    message_key: [u8; 32],
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct ChainState {
    sending_chain_key: [u8; 32],
    receiving_chain_key: [u8; 32],
    /// Counter of the last message sent.
    send_counter: u64,
    /// Highest counter received so far.
    recv_counter: u64,
    skipped: Vec<SkippedKey>,
    #[zeroize(skip)]
    pending_handshake: Option<HandshakeHeader>,
}

impl ChainState {
    fn new(sending_chain_key: [u8; 32], receiving_chain_key: [u8; 32], pending: Option<HandshakeHeader>) -> Self {
        Self {
            sending_chain_key,
            receiving_chain_key,
            send_counter: 0,
            recv_counter: 0,
            skipped: Vec::new(),
            pending_handshake: pending,
        }
    }

    fn encode(&self) -> RatchetState {
        let mut out = Vec::with_capacity(1 + 64 + 16 + 1 + 8 + self.skipped.len() * 40);
        out.push(STATE_VERSION);
        out.extend_from_slice(&self.sending_chain_key);
        out.extend_from_slice(&self.receiving_chain_key);
        out.extend_from_slice(&self.send_counter.to_le_bytes());
        out.extend_from_slice(&self.recv_counter.to_le_bytes());
        match &self.pending_handshake {
            Some(header) => {
                out.push(1);
                header.write_to(&mut out);
            }
            None => out.push(0),
        }
        out.extend_from_slice(&(self.skipped.len() as u64).to_le_bytes());
        for key in &self.skipped {
            out.extend_from_slice(&key.counter.to_le_bytes());
            out.extend_from_slice(&key.message_key);
        }
        RatchetState::new(out)
    }

    fn decode(data: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = Reader::new(data, CryptoError::InvalidState);

        let version = reader.u8()?;
        if version != STATE_VERSION {
            return Err(CryptoError::InvalidState(format!("unsupported version {version}")));
        }

        let mut state = Self::new(reader.array()?, reader.array()?, None);
        state.send_counter = reader.u64()?;
        state.recv_counter = reader.u64()?;
        state.pending_handshake = match reader.u8()? {
            0 => None,
            1 => Some(HandshakeHeader::read_from(&mut reader)?),
            flag => return Err(CryptoError::InvalidState(format!("bad handshake flag {flag}"))),
        };

        let count = usize::try_from(reader.u64()?)
            .ok()
            .filter(|count| *count <= MAX_SKIPPED_KEYS)
            .ok_or_else(|| CryptoError::InvalidState("too many skipped message keys".into()))?;
        state.skipped.reserve(count);
        for _ in 0..count {
            state.skipped.push(SkippedKey {
                counter: reader.u64()?,
                message_key: reader.array()?,
            });
        }

        if !reader.is_empty() {
            return Err(CryptoError::InvalidState("trailing bytes".into()));
        }
        Ok(state)
    }
}

/// Split the X3DH shared secret into (initiator→responder, responder→initiator) chains.
fn derive_chains(ikm: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = Zeroizing::new([0u8; 64]);
    hk.expand(X3DH_INFO, &mut okm[..])
        .map_err(|e| CryptoError::KeyGeneration(format!("HKDF expand failed: {e}")))?;

    let mut initiator_chain = [0u8; 32];
    let mut responder_chain = [0u8; 32];
    initiator_chain.copy_from_slice(&okm[..32]);
    responder_chain.copy_from_slice(&okm[32..]);
    Ok((initiator_chain, responder_chain))
}

/// Advance a chain one step, returning (message key, next chain key).
fn step_chain(chain_key: &[u8; 32]) -> Result<(Zeroizing<[u8; 32]>, [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, chain_key);
    let mut message_key = Zeroizing::new([0u8; 32]);
    let mut next_chain_key = [0u8; 32];
    hk.expand(MESSAGE_KEY_INFO, &mut message_key[..])
        .map_err(|e| CryptoError::KeyGeneration(format!("HKDF: {e}")))?;
    hk.expand(CHAIN_KEY_INFO, &mut next_chain_key)
        .map_err(|e| CryptoError::KeyGeneration(format!("HKDF: {e}")))?;
    Ok((message_key, next_chain_key))
}

fn nonce_for(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn seal(message_key: &[u8; 32], counter: u64, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(message_key)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    cipher
        .encrypt(
            Nonce::from_slice(&nonce_for(counter)),
            Payload { msg: plaintext, aad },
        )
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))
}

fn open(message_key: &[u8; 32], counter: u64, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(message_key)
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;
    cipher
        .decrypt(
            Nonce::from_slice(&nonce_for(counter)),
            Payload { msg: ciphertext, aad },
        )
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))
}

fn x25519_public(bytes: &[u8], what: &str) -> Result<X25519Public, CryptoError> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{what} public key must be 32 bytes")))?;
    Ok(X25519Public::from(bytes))
}

fn x25519_secret(bytes: &[u8], what: &str) -> Result<StaticSecret, CryptoError> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{what} private key must be 32 bytes")))?;
    Ok(StaticSecret::from(bytes))
}

impl RatchetEngine for X3dhRatchet {
    fn initiate(
        &self,
        own_identity: &Identity,
        peer_identity_public_key: &[u8],
        peer_long_term_public_key: &[u8],
        peer_one_time_public_key: Option<&[u8]>,
    ) -> Result<RatchetState, CryptoError> {
        let peer_identity = Identity::peer_dh_public(peer_identity_public_key)?;
        let peer_long_term = x25519_public(peer_long_term_public_key, "long-term")?;
        let peer_one_time = peer_one_time_public_key
            .map(|key| x25519_public(key, "one-time"))
            .transpose()?;

        let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = X25519Public::from(&ephemeral_secret);

        let mut ikm = Zeroizing::new(Vec::with_capacity(128));
        ikm.extend_from_slice(own_identity.dh_secret().diffie_hellman(&peer_long_term).as_bytes());
        ikm.extend_from_slice(ephemeral_secret.diffie_hellman(&peer_identity).as_bytes());
        ikm.extend_from_slice(ephemeral_secret.diffie_hellman(&peer_long_term).as_bytes());
        if let Some(one_time) = &peer_one_time {
            ikm.extend_from_slice(ephemeral_secret.diffie_hellman(one_time).as_bytes());
        }
        let (initiator_chain, responder_chain) = derive_chains(&ikm)?;

        let handshake = HandshakeHeader {
            sender_identity_key_id: self.crypto.key_id(&own_identity.public_key_bytes()),
            receiver_identity_key_id: self.crypto.key_id(peer_identity_public_key),
            long_term_key_id: self.crypto.key_id(peer_long_term_public_key),
            one_time_key_id: peer_one_time_public_key.map(|key| self.crypto.key_id(key)),
            ephemeral_key: ephemeral_public.to_bytes(),
        };
        tracing::debug!(
            long_term_key_id = %handshake.long_term_key_id,
            with_one_time_key = handshake.one_time_key_id.is_some(),
            "x3dh initiated"
        );

        Ok(ChainState::new(initiator_chain, responder_chain, Some(handshake)).encode())
    }

    fn respond(
        &self,
        peer_identity_public_key: &[u8],
        own_identity: &Identity,
        own_long_term_private_key: &[u8],
        own_one_time_private_key: Option<&[u8]>,
        handshake: &RatchetMessage,
    ) -> Result<RatchetState, CryptoError> {
        let header = handshake
            .handshake()
            .ok_or_else(|| CryptoError::InvalidMessage("expected a prekey message".into()))?;
        if header.one_time_key_id.is_some() != own_one_time_private_key.is_some() {
            return Err(CryptoError::InvalidKey(
                "one-time key presence does not match the handshake".into(),
            ));
        }

        let peer_identity = Identity::peer_dh_public(peer_identity_public_key)?;
        let peer_ephemeral = X25519Public::from(header.ephemeral_key);
        let long_term = x25519_secret(own_long_term_private_key, "long-term")?;
        let one_time = own_one_time_private_key
            .map(|key| x25519_secret(key, "one-time"))
            .transpose()?;

        let mut ikm = Zeroizing::new(Vec::with_capacity(128));
        ikm.extend_from_slice(long_term.diffie_hellman(&peer_identity).as_bytes());
        ikm.extend_from_slice(own_identity.dh_secret().diffie_hellman(&peer_ephemeral).as_bytes());
        ikm.extend_from_slice(long_term.diffie_hellman(&peer_ephemeral).as_bytes());
        if let Some(one_time) = &one_time {
            ikm.extend_from_slice(one_time.diffie_hellman(&peer_ephemeral).as_bytes());
        }
        let (initiator_chain, responder_chain) = derive_chains(&ikm)?;

        tracing::debug!(long_term_key_id = %header.long_term_key_id, "x3dh responded");
        // Responder swaps sending/receiving relative to the initiator.
        Ok(ChainState::new(responder_chain, initiator_chain, None).encode())
    }

    fn encrypt(&self, state: &mut RatchetState, plaintext: &[u8]) -> Result<RatchetMessage, CryptoError> {
        let mut chain = ChainState::decode(state.as_bytes())?;
        let counter = chain
            .send_counter
            .checked_add(1)
            .ok_or_else(|| CryptoError::EncryptionError("send counter exhausted".into()))?;
        let (message_key, next_chain_key) = step_chain(&chain.sending_chain_key)?;

        let mut message = RatchetMessage {
            handshake: chain.pending_handshake.clone(),
            counter,
            ciphertext: Vec::new(),
        };
        message.ciphertext = seal(&message_key, counter, plaintext, &message.header_bytes())?;

        chain.sending_chain_key = next_chain_key;
        chain.send_counter = counter;
        *state = chain.encode();
        Ok(message)
    }

    fn decrypt(&self, state: &mut RatchetState, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError> {
        let mut chain = ChainState::decode(state.as_bytes())?;
        let aad = message.header_bytes();

        let plaintext = if message.counter <= chain.recv_counter {
            let position = chain
                .skipped
                .iter()
                .position(|key| key.counter == message.counter)
                .ok_or_else(|| {
                    CryptoError::DecryptionError(format!("message {} already received", message.counter))
                })?;
            let plaintext = open(&chain.skipped[position].message_key, message.counter, &message.ciphertext, &aad)?;
            chain.skipped.remove(position).zeroize();
            plaintext
        } else {
            if message.counter - chain.recv_counter > MAX_SKIP {
                return Err(CryptoError::DecryptionError(format!(
                    "message {} is too far ahead of {}",
                    message.counter, chain.recv_counter
                )));
            }

            let mut chain_key = chain.receiving_chain_key;
            for counter in chain.recv_counter + 1..message.counter {
                let (message_key, next_chain_key) = step_chain(&chain_key)?;
                chain.skipped.push(SkippedKey {
                    counter,
                    message_key: *message_key,
                });
                chain_key = next_chain_key;
            }
            let (message_key, next_chain_key) = step_chain(&chain_key)?;
            chain_key.zeroize();
            let plaintext = open(&message_key, message.counter, &message.ciphertext, &aad)?;

            chain.receiving_chain_key = next_chain_key;
            chain.recv_counter = message.counter;
            if chain.skipped.len() > MAX_SKIPPED_KEYS {
                let excess = chain.skipped.len() - MAX_SKIPPED_KEYS;
                for mut dropped in chain.skipped.drain(..excess) {
                    dropped.zeroize();
                }
            }
            plaintext
        };

        // Any authenticated inbound message means the peer has our session.
        chain.pending_handshake = None;
        *state = chain.encode();
        Ok(plaintext)
    }

    fn serialize(&self, state: &RatchetState) -> Vec<u8> {
        state.as_bytes().to_vec()
    }

    fn deserialize(&self, data: &[u8]) -> Result<RatchetState, CryptoError> {
        ChainState::decode(data)?;
        Ok(RatchetState::new(data.to_vec()))
    }

    fn parse_message(&self, data: &[u8]) -> Result<RatchetMessage, CryptoError> {
        RatchetMessage::from_bytes(data)
    }
}
