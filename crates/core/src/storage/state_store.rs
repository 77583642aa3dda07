use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedMutexGuard, RwLock};

/// Format version written into every persisted entry
pub const STATE_FORMAT_VERSION: &str = "1.0";

/// One persisted key as written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    pub key: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl StoredEntry {
    pub fn new(key: &str, data: Value) -> Self {
        Self {
            key: key.to_string(),
            data,
            timestamp: Utc::now(),
            version: STATE_FORMAT_VERSION.to_string(),
        }
    }
}

/// Key-addressed persistence backend
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a value under a key, replacing any previous value
    async fn save(&self, key: &str, data: &Value) -> Result<()>;

    /// Load a value. Missing keys are `None`, not an error.
    async fn load(&self, key: &str) -> Result<Option<Value>>;

    /// Remove a key, returning whether it existed
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Check if a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// All persisted keys, sorted
    async fn keys(&self) -> Result<Vec<String>>;

    /// Remove every key
    async fn clear(&self) -> Result<()> {
        for key in self.keys().await? {
            self.remove(&key).await?;
        }
        Ok(())
    }
}

/// Filename for a key: anything outside `[A-Za-z0-9_-]` becomes `_`
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// File-backed store: one JSON file per key under a base directory.
///
/// Operations on the same file are serialized; concurrent writers to one key
/// still race at the caller level. Keys that sanitize to the same filename
/// share a file, and reads only answer for the key recorded in its body.
pub struct FileStateStore {
    base_path: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held while operating on one state file; drops its lock entry when no one
/// else is waiting on it
struct FileGuard<'a> {
    store: &'a FileStateStore,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FileGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.store.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.name);
        }
    }
}

impl FileStateStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)
            .map_err(|e| EngineError::state_io("Failed to create state directory", e))?;
        Ok(Self {
            base_path,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", sanitize_key(key)))
    }

    async fn lock_file(&self, key: &str) -> FileGuard<'_> {
        let name = sanitize_key(key);
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.clone())
            .or_default()
            .clone();

        FileGuard {
            store: self,
            name,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn read_entry(path: &Path) -> Result<StoredEntry> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| EngineError::state_io("Failed to read state file", e))?;
        serde_json::from_slice(&raw)
            .map_err(|e| EngineError::state_io("Failed to parse state file", e))
    }

    /// Entry stored for exactly `key`, if any
    async fn read_own_entry(&self, key: &str) -> Result<Option<StoredEntry>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let entry = Self::read_entry(&path).await?;
        if entry.key != key {
            tracing::debug!("State file {} holds key {}, not {}", path.display(), entry.key, key);
            return Ok(None);
        }
        Ok(Some(entry))
    }
}

#[async_trait::async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, key: &str, data: &Value) -> Result<()> {
        let _guard = self.lock_file(key).await;

        let entry = StoredEntry::new(key, data.clone());
        let body = serde_json::to_vec_pretty(&entry)
            .map_err(|e| EngineError::state_io("Failed to serialize state", e))?;

        tokio::fs::write(self.entry_path(key), body)
            .await
            .map_err(|e| EngineError::state_io("Failed to write state file", e))?;

        tracing::trace!(key, "Saved state entry");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock_file(key).await;
        Ok(self.read_own_entry(key).await?.map(|entry| entry.data))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let _guard = self.lock_file(key).await;

        if self.read_own_entry(key).await?.is_none() {
            return Ok(false);
        }

        tokio::fs::remove_file(self.entry_path(key))
            .await
            .map_err(|e| EngineError::state_io("Failed to delete state file", e))?;
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let _guard = self.lock_file(key).await;
        Ok(self.read_own_entry(key).await?.is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut dir = tokio::fs::read_dir(&self.base_path)
            .await
            .map_err(|e| EngineError::state_io("Failed to read state directory", e))?;

        let mut keys = Vec::new();
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| EngineError::state_io("Failed to read state directory entry", e))?
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            // Filenames are lossy, so the key comes from the body.
            match Self::read_entry(&path).await {
                Ok(entry) => keys.push(entry.key),
                Err(e) => tracing::warn!("Ignoring unreadable state file {}: {}", path.display(), e),
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// In-memory store for tests and ephemeral pipelines
#[derive(Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, key: &str, data: &Value) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), StoredEntry::new(key, data.clone()));
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).map(|e| e.data.clone()))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}
