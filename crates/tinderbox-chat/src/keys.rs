//! Prekey records kept in local storage and the public key sets exchanged
//! with the key distribution service.

use std::fmt;

use serde::{Deserialize, Serialize};
use tinderbox_crypto::{CryptoProvider, KeyId};
use zeroize::Zeroizing;

/// A single-use prekey. `orphaned_from` is set once the directory reports the
/// public half as handed out to a peer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeKey {
    pub id: KeyId,
    #[serde(with = "secret_hex")]
    pub key_material: Zeroizing<Vec<u8>>,
    pub orphaned_from: Option<u64>,
}

impl OneTimeKey {
    pub fn new(id: KeyId, key_material: &[u8]) -> Self {
        Self {
            id,
            key_material: Zeroizing::new(key_material.to_vec()),
            orphaned_from: None,
        }
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned_from.is_some()
    }
}

impl fmt::Debug for OneTimeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneTimeKey")
            .field("id", &self.id)
            .field("orphaned_from", &self.orphaned_from)
            .finish_non_exhaustive()
    }
}

/// A signed prekey rotated on a slower schedule. Outdated keys are kept for a
/// grace period so late handshakes can still be answered.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongTermKey {
    pub id: KeyId,
    #[serde(with = "secret_hex")]
    pub key_material: Zeroizing<Vec<u8>>,
    pub creation_date: u64,
    pub outdated_from: Option<u64>,
}

impl LongTermKey {
    pub fn is_outdated(&self) -> bool {
        self.outdated_from.is_some()
    }
}

impl fmt::Debug for LongTermKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongTermKey")
            .field("id", &self.id)
            .field("creation_date", &self.creation_date)
            .field("outdated_from", &self.outdated_from)
            .finish_non_exhaustive()
    }
}

/// A public key with the owner's identity signature over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPublicKey {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedPublicKey {
    pub fn verify(&self, crypto: &dyn CryptoProvider, identity_public_key: &[u8]) -> bool {
        crypto.verify(identity_public_key, &self.public_key, &self.signature)
    }
}

/// A peer's published prekeys as handed out by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeySet {
    pub identity_public_key: Vec<u8>,
    pub long_term_public_key: SignedPublicKey,
    pub one_time_public_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPublicKeySet {
    pub identity: String,
    pub key_set: PublicKeySet,
}

/// A peer to open a session with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub identity: String,
    pub identity_public_key: Vec<u8>,
}

impl Participant {
    pub fn new(identity: impl Into<String>, identity_public_key: impl Into<Vec<u8>>) -> Self {
        Self {
            identity: identity.into(),
            identity_public_key: identity_public_key.into(),
        }
    }
}

mod secret_hex {
    use serde::{Deserialize, Deserializer, Serializer};
    use zeroize::Zeroizing;

    pub fn serialize<S: Serializer>(value: &Zeroizing<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(hex::encode(value.as_slice()));
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Zeroizing<Vec<u8>>, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        hex::decode(encoded.as_str())
            .map(Zeroizing::new)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinderbox_crypto::{DalekCrypto, Identity};

    #[test]
    fn records_persist_as_json() {
        let key = LongTermKey {
            id: KeyId::from([7; 8]),
            key_material: Zeroizing::new(vec![0xab; 32]),
            creation_date: 42,
            outdated_from: None,
        };
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains("\"0707070707070707\""));
        let parsed: LongTermKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn debug_never_prints_key_material() {
        let key = OneTimeKey::new(KeyId::from([1; 8]), &[0xcd; 32]);
        let debug = format!("{key:?}");
        assert!(!debug.contains("cdcd"));
        assert!(!debug.contains("205"));
    }

    #[test]
    fn signed_key_verifies_against_owner() {
        let crypto = DalekCrypto;
        let owner = Identity::generate();
        let pair = crypto.generate_key_pair();
        let signed = SignedPublicKey {
            public_key: pair.public_key.to_vec(),
            signature: crypto.sign(&owner, &pair.public_key),
        };
        assert!(signed.verify(&crypto, &owner.public_key_bytes()));
        assert!(!signed.verify(&crypto, &Identity::generate().public_key_bytes()));
    }
}
