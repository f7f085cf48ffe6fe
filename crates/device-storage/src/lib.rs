//! Byte-addressable persistent storage collaborator. The fabric table and
//! OTA requestor never touch a filesystem or flash partition directly; they
//! go through this trait so a host can swap in whatever backing store its
//! platform provides.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("underlying storage I/O failed: {0}")]
    Io(String),
}

/// Minimal KV interface the fabric table and OTA requestor persist through.
/// Mirrors a platform NVS/KVS abstraction: string keys, opaque byte values.
pub trait PersistentStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn delete(&mut self, key: &str) -> Result<(), StorageError>;
}

/// In-memory store used by unit tests and by hosts with no persistence
/// requirement at all.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entries: HashMap<String, Vec<u8>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

impl PersistentStorage for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        self.entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

/// One file per key under `root_dir`, named after the key. Good enough for
/// development boards and integration tests that need a real filesystem
/// round trip; a production platform almost certainly has its own flash-
/// backed KVS and would implement `PersistentStorage` directly against it.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root_dir: PathBuf,
}

impl FileStorage {
    pub fn new(root_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(Self { root_dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root_dir.join(safe_name)
    }

    fn path_exists(path: &Path) -> bool {
        path.exists()
    }
}

impl PersistentStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key);
        if !Self::path_exists(&path) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        fs::read(&path).map_err(|e| StorageError::Io(e.to_string()))
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);
        fs::write(&path, value).map_err(|e| StorageError::Io(e.to_string()))?;
        debug!(key, bytes = value.len(), "wrote storage entry");
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        if !Self::path_exists(&path) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        fs::remove_file(&path).map_err(|e| StorageError::Io(e.to_string()))
    }
}
