//! Durable key-value substrates for the persistent tier
//!
//! The persistent tier only needs byte-level `read`/`write`/`delete`/`keys`.
//! [`FileStore`] keeps one file per key in a directory and survives restarts;
//! [`MemoryStore`] is a cloneable in-memory handle used for tests and for
//! runs where durability is not wanted.

use crate::error::{CacheError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Byte-oriented durable key-value storage
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read the bytes stored under `key`
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `bytes` under `key`, replacing any previous value
    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Delete `key`, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Every key currently stored
    async fn keys(&self) -> Result<Vec<String>>;
}

/// In-memory substrate; clones share the same storage
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.inner.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.inner.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.inner.read().await.keys().cloned().collect())
    }
}

const ENTRY_EXTENSION: &str = "entry";

/// Directory-backed substrate
///
/// Each key lives in `<sha256(key)>.entry`, holding the key on the first line
/// followed by the payload. Writes go through a temporary file and a rename so
/// a crash never leaves a half-written record behind.
pub struct FileStore {
    dir: PathBuf,
    index: RwLock<HashMap<String, PathBuf>>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir` and index its records
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut index = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }

            match Self::read_record(&path).await {
                Ok(Some((key, _))) => {
                    index.insert(key, path);
                }
                Ok(None) => {
                    warn!("Removing malformed cache record {:?}", path);
                    let _ = tokio::fs::remove_file(&path).await;
                }
                Err(e) => warn!("Skipping unreadable cache record {:?}: {}", path, e),
            }
        }

        info!("Opened file store at {:?} ({} records)", dir, index.len());

        Ok(Self {
            dir,
            index: RwLock::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{}.{}", name, ENTRY_EXTENSION))
    }

    async fn read_record(path: &Path) -> Result<Option<(String, Vec<u8>)>> {
        let raw = tokio::fs::read(path).await?;

        let Some(split) = raw.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };

        match String::from_utf8(raw[..split].to_vec()) {
            Ok(key) => Ok(Some((key, raw[split + 1..].to_vec()))),
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = match self.index.read().await.get(key) {
            Some(path) => path.clone(),
            None => return Ok(None),
        };

        match Self::read_record(&path).await {
            Ok(Some((stored_key, payload))) if stored_key == key => Ok(Some(payload)),
            Ok(_) => Err(CacheError::StorageError(format!(
                "record for {} at {:?} is malformed",
                key, path
            ))),
            Err(CacheError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                self.index.write().await.remove(key);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        if key.contains('\n') {
            return Err(CacheError::StorageError(format!(
                "key {:?} contains a newline",
                key
            )));
        }

        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");

        let mut record = Vec::with_capacity(key.len() + 1 + bytes.len());
        record.extend_from_slice(key.as_bytes());
        record.push(b'\n');
        record.extend_from_slice(&bytes);

        tokio::fs::write(&tmp, &record).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.index.write().await.insert(key.to_string(), path);
        debug!("Wrote {} bytes for {}", bytes.len(), key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let Some(path) = self.index.write().await.remove(key) else {
            return Ok(false);
        };

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.index.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_shares_state_between_clones() {
        let store = MemoryStore::new();
        let clone = store.clone();

        store.write("a", b"1".to_vec()).await.unwrap();
        assert_eq!(clone.read("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(clone.len().await, 1);

        assert!(clone.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_file_store_round_trip_and_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.write("rpc-cache:profile:getDoctor:public:1", b"{\"x\":1}".to_vec())
                .await
                .unwrap();
            store.write("other", b"payload\nwith newline".to_vec()).await.unwrap();
        }

        let store = FileStore::open(dir.path()).await.unwrap();
        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["other", "rpc-cache:profile:getDoctor:public:1"]);
        assert_eq!(
            store.read("other").await.unwrap(),
            Some(b"payload\nwith newline".to_vec())
        );

        assert!(store.delete("other").await.unwrap());
        assert_eq!(store.read("other").await.unwrap(), None);
        assert!(!store.delete("other").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_drops_malformed_records() {
        let dir = tempfile::tempdir().unwrap();
        let junk = dir.path().join("deadbeef.entry");
        tokio::fs::write(&junk, b"no newline here").await.unwrap();

        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
        assert!(!junk.exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_newline_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        let err = store.write("bad\nkey", vec![]).await.unwrap_err();
        assert!(matches!(err, CacheError::StorageError(_)));
    }
}
