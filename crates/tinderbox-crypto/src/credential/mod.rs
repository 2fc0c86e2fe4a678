//! Durable key-value storage for private key material.
//!
//! Entries are addressed by `(namespace, key)`. The chat layer keeps one-time
//! keys, long-term keys and sessions in separate namespaces; backends only
//! ever see opaque bytes.

mod file;
mod memory;
mod sealed;

pub use file::FileCredentialStore;
pub use memory::MemoryCredentialStore;
pub use sealed::SealedCredentialStore;

use crate::CryptoError;

/// Trait for credential storage. Abstracts over the actual backend.
pub trait CredentialStore: Send + Sync {
    /// Write an entry, replacing any previous value.
    fn store_entry(&self, namespace: &str, key: &str, data: &[u8]) -> Result<(), CryptoError>;

    /// Read an entry.
    fn load_entry(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Remove an entry. Fails with `StorageError` if it does not exist.
    fn delete_entry(&self, namespace: &str, key: &str) -> Result<(), CryptoError>;

    /// List all keys in a namespace, in no particular order.
    fn list_entries(&self, namespace: &str) -> Result<Vec<String>, CryptoError>;

    /// Check if an entry exists.
    fn entry_exists(&self, namespace: &str, key: &str) -> Result<bool, CryptoError> {
        Ok(self.load_entry(namespace, key)?.is_some())
    }
}

/// Namespace holding the serialized one-time key set of each identity.
pub const NAMESPACE_ONE_TIME_KEYS: &str = "one-time-keys";

/// Namespace prefix for long-term keys; suffixed with the owning identity.
pub const NAMESPACE_LONG_TERM_KEYS: &str = "long-term-keys";

/// Namespace prefix for ratchet sessions; suffixed with the owning identity.
pub const NAMESPACE_SESSIONS: &str = "sessions";

/// Build the per-identity namespace name for a namespace prefix.
pub fn identity_namespace(prefix: &str, identity: &str) -> String {
    format!("{prefix}/{identity}")
}

fn missing_entry(namespace: &str, key: &str) -> CryptoError {
    CryptoError::StorageError(format!("no entry {key} in {namespace}"))
}
