//! Crypto provider: prekey generation, key fingerprints and signatures.
//!
//! Components receive the provider explicitly (`Arc<dyn CryptoProvider>`)
//! rather than reaching for a process-wide instance.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::Identity;

/// Length of a key fingerprint in bytes.
pub const KEY_ID_LEN: usize = 8;

/// Deterministic fingerprint of a public key: the first 8 bytes of
/// SHA-512 over the exported key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId([u8; KEY_ID_LEN]);

impl KeyId {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_ID_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("key id must be {KEY_ID_LEN} bytes")))?;
        Ok(Self(bytes))
    }

    pub fn from_hex(hex_id: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_id)
            .map_err(|e| CryptoError::InvalidKey(format!("key id is not hex: {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; KEY_ID_LEN]> for KeyId {
    fn from(bytes: [u8; KEY_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.to_hex())
    }
}

impl Serialize for KeyId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_id = String::deserialize(deserializer)?;
        Self::from_hex(&hex_id).map_err(serde::de::Error::custom)
    }
}

/// A freshly generated X25519 prekey pair.
pub struct KeyPair {
    pub private_key: Zeroizing<[u8; 32]>,
    pub public_key: [u8; 32],
}

/// Key operations the prekey lifecycle depends on.
pub trait CryptoProvider: Send + Sync {
    /// Generate an X25519 key pair for use as a long-term or one-time prekey.
    fn generate_key_pair(&self) -> KeyPair;

    /// Fingerprint an exported public key.
    fn key_id(&self, public_key: &[u8]) -> KeyId;

    /// Sign `data` with the identity key.
    fn sign(&self, identity: &Identity, data: &[u8]) -> Vec<u8>;

    /// Check a signature made by the owner of `identity_public_key`.
    fn verify(&self, identity_public_key: &[u8], data: &[u8], signature: &[u8]) -> bool;

    /// Fill `buffer` from the OS CSPRNG.
    fn random_bytes(&self, buffer: &mut [u8]);
}

/// Production provider built on the dalek curve implementations.
#[derive(Debug, Clone, Copy, Default)]
pub struct DalekCrypto;

impl CryptoProvider for DalekCrypto {
    fn generate_key_pair(&self) -> KeyPair {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public_key = X25519Public::from(&secret).to_bytes();
        KeyPair {
            private_key: Zeroizing::new(secret.to_bytes()),
            public_key,
        }
    }

    fn key_id(&self, public_key: &[u8]) -> KeyId {
        let digest = Sha512::digest(public_key);
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&digest[..KEY_ID_LEN]);
        KeyId(id)
    }

    fn sign(&self, identity: &Identity, data: &[u8]) -> Vec<u8> {
        identity.sign(data).to_vec()
    }

    fn verify(&self, identity_public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
        Identity::verify(identity_public_key, data, signature).is_ok()
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        OsRng.fill_bytes(buffer);
    }
}
