use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::CredentialStore;
use crate::CryptoError;

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const SEAL_INFO: &[u8] = b"tinderbox-credentials-v1";

/// Encrypts every value at rest before handing it to the inner store.
///
/// The sealing key is HKDF-SHA256 over a caller-supplied secret. Each value
/// is stored as `[24-byte nonce || ciphertext || 16-byte tag]` under
/// XChaCha20-Poly1305, with `namespace || 0 || key` as associated data so an
/// entry copied to another slot fails to open.
pub struct SealedCredentialStore<S> {
    inner: S,
    key: Zeroizing<[u8; 32]>,
}

impl<S: CredentialStore> SealedCredentialStore<S> {
    pub fn new(inner: S, secret: &[u8]) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(None, secret);
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(SEAL_INFO, &mut key[..])
            .map_err(|e| CryptoError::KeyGeneration(format!("HKDF expand failed: {e}")))?;
        Ok(Self { inner, key })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, CryptoError> {
        XChaCha20Poly1305::new_from_slice(&self.key[..])
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    fn seal(&self, namespace: &str, key: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let aad = associated_data(namespace, key);

        let ciphertext = self
            .cipher()?
            .encrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    fn open(&self, namespace: &str, key: &str, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::DecryptionError("sealed entry too short".into()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let aad = associated_data(namespace, key);

        self.cipher()?
            .decrypt(
                XNonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))
    }
}

fn associated_data(namespace: &str, key: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(namespace.len() + key.len() + 1);
    aad.extend_from_slice(namespace.as_bytes());
    aad.push(0);
    aad.extend_from_slice(key.as_bytes());
    aad
}

impl<S: CredentialStore> CredentialStore for SealedCredentialStore<S> {
    fn store_entry(&self, namespace: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        let sealed = self.seal(namespace, key, data)?;
        self.inner.store_entry(namespace, key, &sealed)
    }

    fn load_entry(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        self.inner
            .load_entry(namespace, key)?
            .map(|sealed| self.open(namespace, key, &sealed))
            .transpose()
    }

    fn delete_entry(&self, namespace: &str, key: &str) -> Result<(), CryptoError> {
        self.inner.delete_entry(namespace, key)
    }

    fn list_entries(&self, namespace: &str) -> Result<Vec<String>, CryptoError> {
        self.inner.list_entries(namespace)
    }

    fn entry_exists(&self, namespace: &str, key: &str) -> Result<bool, CryptoError> {
        self.inner.entry_exists(namespace, key)
    }
}
