//! Durable key/value storage for credential fields.
//!
//! Three backends share the [`CredentialStorage`] trait:
//! - [`FileStorage`]: a JSON map on disk, survives restarts
//! - [`KeyringStorage`]: the OS keychain, one entry per key
//! - [`MemoryStorage`]: process-local, for tests and throwaway sessions

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use keyring::Entry;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Keychain access failed: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Key/value store holding the persisted credential.
///
/// `set_many` and `remove_many` apply all entries together so a reader
/// never observes half of a credential. Backends without transactions
/// (the keychain) undo the entries already written when a later one fails.
pub trait CredentialStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StorageError>;

    fn remove_many(&self, keys: &[&str]) -> Result<(), StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.set_many(&[(key, value)])
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.remove_many(&[key])
    }
}

// ============================================================================
// Memory
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `entries`
    pub fn with_entries(entries: &[(&str, &str)]) -> Self {
        let map = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            entries: Mutex::new(map),
        }
    }

    /// Copy of every stored entry
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.entries.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

impl CredentialStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StorageError> {
        let mut map = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        for (k, v) in entries {
            map.insert(k.to_string(), v.to_string());
        }
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), StorageError> {
        let mut map = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        for k in keys {
            map.remove(*k);
        }
        Ok(())
    }
}

// ============================================================================
// File
// ============================================================================

/// Session file name in the data directory
pub const SESSION_FILE: &str = "session.json";

/// JSON map persisted to a single file.
///
/// Every write rewrites the whole file through a temporary sibling and a
/// rename, so the on-disk map is always complete.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Store at `<dir>/session.json`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SESSION_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<HashMap<String, String>, StorageError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<(), StorageError> {
        if map.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(map)?;
        std::fs::write(&tmp, contents)?;

        // Set file permissions to 0600 on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), keys = map.len(), "Session file written");
        Ok(())
    }
}

impl CredentialStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(self.read_map()?.remove(key))
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StorageError> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        let mut map = self.read_map()?;
        for (k, v) in entries {
            map.insert(k.to_string(), v.to_string());
        }
        self.write_map(&map)
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), StorageError> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        let mut map = self.read_map()?;
        let before = map.len();
        for k in keys {
            map.remove(*k);
        }
        if map.len() != before {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

// ============================================================================
// Keyring
// ============================================================================

/// Keychain service name used when none is configured
pub const DEFAULT_KEYRING_SERVICE: &str = "quill";

/// OS keychain storage. Each credential field is its own entry under
/// `service`; multi-key writes are applied entry by entry and rolled back
/// on failure.
#[derive(Debug, Clone)]
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StorageError> {
        Ok(Entry::new(&self.service, key)?)
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new(DEFAULT_KEYRING_SERVICE)
    }
}

/// Single-entry operations of a store that has no multi-key write
trait EntryStore {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

impl EntryStore for KeyringStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        Ok(self.entry(key)?.set_password(value)?)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write every entry, or restore the ones already written and fail.
fn write_all_or_restore(store: &impl EntryStore, entries: &[(&str, &str)]) -> Result<(), StorageError> {
    let mut written: Vec<(&str, Option<String>)> = Vec::with_capacity(entries.len());
    for &(key, value) in entries {
        let result = store.read(key).and_then(|previous| {
            store.write(key, value)?;
            Ok(previous)
        });
        match result {
            Ok(previous) => written.push((key, previous)),
            Err(e) => {
                warn!(key, error = %e, "Multi-key write failed, restoring previous entries");
                for (key, previous) in written.iter().rev() {
                    let restored = match previous {
                        Some(value) => store.write(key, value),
                        None => store.delete(key),
                    };
                    if let Err(e) = restored {
                        warn!(key = *key, error = %e, "Failed to restore entry");
                    }
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

impl CredentialStorage for KeyringStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.read(key)
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StorageError> {
        write_all_or_restore(self, entries)
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), StorageError> {
        for key in keys {
            self.delete(key)?;
        }
        Ok(())
    }
}
