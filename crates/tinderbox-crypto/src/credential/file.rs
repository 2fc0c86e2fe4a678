use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::{missing_entry, CredentialStore};
use crate::CryptoError;

const TEMP_SUFFIX: &str = ".tmp";
const KEY_SUFFIX: &str = ".key";
const HASHED_PREFIX: &str = "~";

/// Longest hex name stored verbatim. Leaves room for the suffixes under the
/// common 255-byte file name limit.
const MAX_PLAIN_NAME: usize = 200;

/// File-system credential store.
///
/// Layout: `<root>/<name(namespace)>/<name(key)>`, one file per entry. Names
/// are hex-encoded so any string maps to a portable file name. Names whose
/// encoding would be too long become `~<hex(sha256)>`; for keys the original
/// string is kept next to the entry in a `.key` file so it can be listed.
/// Writes go to a temp file first and are renamed into place, so a crash
/// never leaves a half-written entry behind.
pub struct FileCredentialStore {
    root: PathBuf,
}

/// On-disk name for `name`, and whether it had to be hashed.
fn encode_name(name: &str) -> (String, bool) {
    let encoded = hex::encode(name);
    if encoded.len() <= MAX_PLAIN_NAME {
        (encoded, false)
    } else {
        let digest = Sha256::digest(name.as_bytes());
        (format!("{HASHED_PREFIX}{}", hex::encode(digest)), true)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), CryptoError> {
    let temp = with_suffix(path, TEMP_SUFFIX);
    fs::write(&temp, data)?;
    fs::rename(&temp, path)?;
    Ok(())
}

impl FileCredentialStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CryptoError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(encode_name(namespace).0)
    }

    fn entry_path(&self, namespace: &str, key: &str) -> (PathBuf, bool) {
        let (name, hashed) = encode_name(key);
        (self.namespace_dir(namespace).join(name), hashed)
    }

    fn decode_entry(dir: &Path, name: &str) -> Result<Option<String>, CryptoError> {
        if name.starts_with(HASHED_PREFIX) {
            return match fs::read(dir.join(format!("{name}{KEY_SUFFIX}"))) {
                Ok(raw) => Ok(String::from_utf8(raw).ok()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            };
        }
        Ok(hex::decode(name).ok().and_then(|raw| String::from_utf8(raw).ok()))
    }
}

impl CredentialStore for FileCredentialStore {
    fn store_entry(&self, namespace: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        fs::create_dir_all(self.namespace_dir(namespace))?;

        let (path, hashed) = self.entry_path(namespace, key);
        if hashed {
            // Key file first, so a listed entry always has its name.
            write_atomic(&with_suffix(&path, KEY_SUFFIX), key.as_bytes())?;
        }
        write_atomic(&path, data)
    }

    fn load_entry(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        match fs::read(self.entry_path(namespace, key).0) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_entry(&self, namespace: &str, key: &str) -> Result<(), CryptoError> {
        let (path, hashed) = self.entry_path(namespace, key);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(missing_entry(namespace, key)),
            Err(e) => return Err(e.into()),
        }
        if hashed {
            match fs::remove_file(with_suffix(&path, KEY_SUFFIX)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn list_entries(&self, namespace: &str) -> Result<Vec<String>, CryptoError> {
        let dir_path = self.namespace_dir(namespace);
        let dir = match fs::read_dir(&dir_path) {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for entry in dir {
            let file_name = entry?.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) || name.ends_with(KEY_SUFFIX) {
                continue;
            }
            match Self::decode_entry(&dir_path, name)? {
                Some(key) => keys.push(key),
                None => tracing::warn!(file = name, "skipping foreign file in credential store"),
            }
        }
        Ok(keys)
    }
}
