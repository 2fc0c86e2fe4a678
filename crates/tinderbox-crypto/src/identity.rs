use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// The long-lived identity key of a chat participant.
///
/// Signs long-term prekeys so peers can check they really belong to us, and
/// doubles as the static Diffie-Hellman key in X3DH (converted to X25519).
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from its 32-byte secret.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Exported public identity key (Ed25519, 32 bytes).
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Secret key bytes, for persisting the identity.
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    /// Sign `message`, returning the 64-byte Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify `signature` over `message` against an exported identity key.
    pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let public_key = verifying_key(public_key)?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| CryptoError::VerificationError(format!("malformed signature: {e}")))?;
        public_key
            .verify(message, &signature)
            .map_err(|e| CryptoError::VerificationError(e.to_string()))
    }

    /// X25519 secret for key agreement.
    ///
    /// Uses the SHA-512-expanded scalar so the matching public key equals the
    /// Edwards→Montgomery image of our Ed25519 public key.
    pub fn dh_secret(&self) -> StaticSecret {
        StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    /// X25519 public key matching [`Identity::dh_secret`].
    pub fn dh_public(&self) -> X25519Public {
        X25519Public::from(&self.dh_secret())
    }

    /// Convert a peer's exported Ed25519 identity key to X25519.
    pub fn peer_dh_public(public_key: &[u8]) -> Result<X25519Public, CryptoError> {
        let montgomery = verifying_key(public_key)?.to_montgomery();
        Ok(X25519Public::from(montgomery.to_bytes()))
    }
}

fn verifying_key(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let bytes: &[u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("identity key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(bytes)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid Ed25519 public key: {e}")))
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}
