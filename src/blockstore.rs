//! # Block Store
//!
//! Content-addressed block storage on the local filesystem. A block's key is
//! the blake3 digest of its bytes, and the block lives at
//! `<root>/<first two hex chars>/<full hex>`.
//!
//! Writes go to a temporary file in the same directory and are renamed into
//! place, so a reader never observes a partially written block. Writes to the
//! same key are serialized through a striped lock table; different keys proceed
//! concurrently. Reads re-hash the bytes, so out-of-band corruption surfaces as
//! [`BlockStoreError::Corruption`] rather than wrong data.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// A 32-byte content address.
pub type Key = [u8; 32];

const LOCK_STRIPES: usize = 64;

#[derive(Debug, Error)]
pub enum BlockStoreError {
    #[error("block store I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("block {} not found", hex::encode(.0))]
    NotFound(Key),
    #[error("block {} is corrupt (content hashes to {})", hex::encode(.expected), hex::encode(.actual))]
    Corruption { expected: Key, actual: Key },
}

impl BlockStoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        BlockStoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub fn hash_content(data: &[u8]) -> Key {
    *blake3::hash(data).as_bytes()
}

#[derive(Debug)]
pub struct BlockStore {
    root: PathBuf,
    locks: Vec<Mutex<()>>,
    temp_counter: AtomicU64,
}

impl BlockStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, BlockStoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| BlockStoreError::io(&root, e))?;
        debug!(path = %root.display(), "block store mounted");
        Ok(Self {
            root,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            temp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &Key) -> PathBuf {
        let hex = hex::encode(key);
        self.root.join(&hex[..2]).join(hex)
    }

    fn lock_for(&self, key: &Key) -> &Mutex<()> {
        &self.locks[key[0] as usize % LOCK_STRIPES]
    }

    /// Store `data` and return its key. Storing the same bytes twice is a no-op.
    pub async fn put(&self, data: &[u8]) -> Result<Key, BlockStoreError> {
        let key = hash_content(data);
        let path = self.path_for(&key);

        let _guard = self.lock_for(&key).lock().await;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            trace!(key = %hex::encode(&key[..8]), "block already present");
            return Ok(key);
        }

        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BlockStoreError::io(&dir, e))?;

        let seq = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let temp = dir.join(format!(".{}.{}.tmp", hex::encode(&key[..8]), seq));
        if let Err(e) = write_file(&temp, data).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(BlockStoreError::io(&temp, e));
        }
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(BlockStoreError::io(&path, e));
        }

        debug!(key = %hex::encode(&key[..8]), len = data.len(), "block stored");
        Ok(key)
    }

    pub async fn get(&self, key: &Key) -> Result<Vec<u8>, BlockStoreError> {
        let path = self.path_for(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlockStoreError::NotFound(*key))
            }
            Err(e) => return Err(BlockStoreError::io(&path, e)),
        };
        let actual = hash_content(&data);
        if &actual != key {
            warn!(key = %hex::encode(&key[..8]), path = %path.display(), "corrupt block on disk");
            return Err(BlockStoreError::Corruption {
                expected: *key,
                actual,
            });
        }
        Ok(data)
    }

    pub async fn has(&self, key: &Key) -> bool {
        tokio::fs::try_exists(self.path_for(key))
            .await
            .unwrap_or(false)
    }
}

async fn write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn store() -> (tempfile::TempDir, BlockStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path().join("blocks")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_then_get_returns_same_bytes() {
        let (_dir, store) = store().await;
        let key = store.put(b"hello").await.unwrap();
        assert_eq!(key, hash_content(b"hello"));
        assert_eq!(store.get(&key).await.unwrap(), b"hello");
        assert!(store.has(&key).await);
    }

    #[tokio::test]
    async fn layout_uses_two_char_fanout() {
        let (_dir, store) = store().await;
        let key = store.put(b"layout").await.unwrap();
        let hex = hex::encode(key);
        let expected = store.root().join(&hex[..2]).join(&hex);
        assert!(expected.is_file());
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let (_dir, store) = store().await;
        let a = store.put(b"same").await.unwrap();
        let b = store.put(b"same").await.unwrap();
        assert_eq!(a, b);

        let shard = store.path_for(&a).parent().unwrap().to_path_buf();
        let entries = std::fs::read_dir(shard).unwrap().count();
        assert_eq!(entries, 1, "no duplicate or leftover temp files");
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let (_dir, store) = store().await;
        let key = hash_content(b"never stored");
        assert!(matches!(store.get(&key).await, Err(BlockStoreError::NotFound(k)) if k == key));
        assert!(!store.has(&key).await);
    }

    #[tokio::test]
    async fn corruption_detected_on_read() {
        let (_dir, store) = store().await;
        let key = store.put(b"original").await.unwrap();
        std::fs::write(store.path_for(&key), b"tampered").unwrap();

        match store.get(&key).await {
            Err(BlockStoreError::Corruption { expected, actual }) => {
                assert_eq!(expected, key);
                assert_eq!(actual, hash_content(b"tampered"));
            }
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_puts_of_same_block() {
        let (_dir, store) = store().await;
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.put(b"contended").await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), hash_content(b"contended"));
        }
        let key = hash_content(b"contended");
        assert_eq!(store.get(&key).await.unwrap(), b"contended");
    }

    #[tokio::test]
    async fn open_fails_when_root_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            BlockStore::open(&file).await,
            Err(BlockStoreError::Io { .. })
        ));
    }
}
