//! Durable key-value storage backing the subscription store
//!
//! [`FileKvStore`] keeps the whole keyspace in one JSON file and rewrites it
//! on every mutation with the temp-file, fsync, rename, fsync-directory
//! sequence, so a crash leaves either the old or the new file on disk.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::BridgeError;

/// Minimal persistence primitive: string keys, string values
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> crate::Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> crate::Result<()>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> crate::Result<bool>;

    /// All entries whose key starts with `prefix`, in key order
    async fn scan(&self, prefix: &str) -> crate::Result<Vec<(String, String)>>;
}

/// Volatile store for tests and for running without a state file
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> crate::Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> crate::Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> crate::Result<bool> {
        Ok(self.entries.lock().await.remove(key).is_some())
    }

    async fn scan(&self, prefix: &str) -> crate::Result<Vec<(String, String)>> {
        Ok(scan_map(&*self.entries.lock().await, prefix))
    }
}

/// Single-file JSON store
#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileKvStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                BridgeError::Store(format!("corrupt store file {:?}: {}", path, e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!("Opened store {:?}", path);
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Write `next` to disk, then install it in memory. On failure the
    /// in-memory map is left untouched.
    async fn commit(
        &self,
        current: &mut BTreeMap<String, String>,
        next: BTreeMap<String, String>,
    ) -> crate::Result<()> {
        let bytes = serde_json::to_vec_pretty(&next)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| BridgeError::Store(format!("store writer panicked: {}", e)))??;
        *current = next;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> crate::Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> crate::Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        let mut next = entries.clone();
        next.insert(key.to_string(), value.to_string());
        self.commit(&mut entries, next).await
    }

    async fn delete(&self, key: &str) -> crate::Result<bool> {
        let mut entries = self.entries.lock().await;
        if !entries.contains_key(key) {
            return Ok(false);
        }
        let mut next = entries.clone();
        next.remove(key);
        self.commit(&mut entries, next).await?;
        Ok(true)
    }

    async fn scan(&self, prefix: &str) -> crate::Result<Vec<(String, String)>> {
        Ok(scan_map(&*self.entries.lock().await, prefix))
    }
}

fn scan_map(entries: &BTreeMap<String, String>, prefix: &str) -> Vec<(String, String)> {
    entries
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp_path, path)?;
    File::open(&parent)?.sync_all()
}
