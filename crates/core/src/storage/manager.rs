use super::state_store::{FileStateStore, MemoryStateStore, StateStore};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

const SNAPSHOT_PREFIX: &str = "__snapshot_";

/// Named group of persisted keys captured at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub keys: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

fn snapshot_key(id: &str) -> String {
    format!("{}{}", SNAPSHOT_PREFIX, id)
}

fn snapshot_entry_key(id: &str, key: &str) -> String {
    format!("{}{}_{}", SNAPSHOT_PREFIX, id, key)
}

/// Key-addressed state persistence with snapshot grouping
#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn StateStore>,
}

impl StateManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// File-backed manager rooted at `base_path`
    pub fn file(base_path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(Arc::new(FileStateStore::new(base_path)?)))
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStateStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub async fn save(&self, key: &str, data: &Value) -> Result<()> {
        self.store.save(key, data).await
    }

    pub async fn load(&self, key: &str) -> Result<Option<Value>> {
        self.store.load(key).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        self.store.remove(key).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.store.exists(key).await
    }

    /// Persisted keys, excluding snapshot bookkeeping
    pub async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .keys()
            .await?
            .into_iter()
            .filter(|k| !k.starts_with(SNAPSHOT_PREFIX))
            .collect())
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await
    }

    /// Serialize and persist a typed value
    pub async fn save_as<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_value(value)
            .map_err(|e| EngineError::state_io(&format!("Failed to serialize {}", key), e))?;
        self.store.save(key, &data).await
    }

    /// Load and deserialize a typed value
    pub async fn load_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.load(key).await? {
            Some(data) => serde_json::from_value(data)
                .map(Some)
                .map_err(|e| EngineError::state_io(&format!("Failed to deserialize {}", key), e)),
            None => Ok(None),
        }
    }

    /// Capture the current values of `keys` under snapshot `id`.
    ///
    /// Keys with no persisted value are left out of the snapshot. An existing
    /// snapshot with the same id is replaced.
    pub async fn create_snapshot(&self, id: &str, keys: &[String]) -> Result<Snapshot> {
        if self.load_snapshot(id).await?.is_some() {
            self.delete_snapshot(id).await?;
        }

        let mut captured = Vec::new();
        for key in keys {
            if let Some(data) = self.store.load(key).await? {
                self.store.save(&snapshot_entry_key(id, key), &data).await?;
                captured.push(key.clone());
            }
        }

        let snapshot = Snapshot {
            id: id.to_string(),
            keys: captured,
            timestamp: Utc::now(),
        };
        self.save_as(&snapshot_key(id), &snapshot).await?;

        tracing::info!(
            "Created snapshot {} with {} keys",
            snapshot.id,
            snapshot.keys.len()
        );
        Ok(snapshot)
    }

    /// Snapshot metadata, if the snapshot exists
    pub async fn load_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        self.load_as(&snapshot_key(id)).await
    }

    /// Write every captured value back to its original key
    pub async fn restore_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        let snapshot = match self.load_snapshot(id).await? {
            Some(snapshot) => snapshot,
            None => return Ok(None),
        };

        for key in &snapshot.keys {
            let data = self
                .store
                .load(&snapshot_entry_key(id, key))
                .await?
                .ok_or_else(|| {
                    EngineError::StateIo(format!("Snapshot {} is missing its copy of {}", id, key))
                })?;
            self.store.save(key, &data).await?;
        }

        tracing::info!("Restored snapshot {}", id);
        Ok(Some(snapshot))
    }

    /// Remove a snapshot and its captured copies
    pub async fn delete_snapshot(&self, id: &str) -> Result<bool> {
        let snapshot = match self.load_snapshot(id).await? {
            Some(snapshot) => snapshot,
            None => return Ok(false),
        };

        for key in &snapshot.keys {
            self.store.remove(&snapshot_entry_key(id, key)).await?;
        }
        self.store.remove(&snapshot_key(id)).await?;

        Ok(true)
    }

    /// All snapshots, oldest first
    pub async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();

        for key in self.store.keys().await? {
            if !key.starts_with(SNAPSHOT_PREFIX) {
                continue;
            }
            // Captured copies share the prefix; only headers round-trip to their own key.
            let Some(data) = self.store.load(&key).await? else {
                continue;
            };
            if let Ok(snapshot) = serde_json::from_value::<Snapshot>(data) {
                if snapshot_key(&snapshot.id) == key {
                    snapshots.push(snapshot);
                }
            }
        }

        snapshots.sort_by_key(|s| s.timestamp);
        Ok(snapshots)
    }
}
