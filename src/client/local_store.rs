//! Client-side local storage
//!
//! A small namespaced key/value interface with an in-memory and a
//! JSON-file implementation. Resumption pointers and upload history are
//! built on top of it. Nothing here is authoritative: the server's session
//! records always win.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::upload::SessionState;

/// Local store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// Key/Value Store
// ============================================================================

/// Namespaced JSON key/value storage
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Insert or replace
    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError>;

    /// Remove a key. Absent keys are not an error.
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;

    /// Every value in a namespace, ordered by key
    async fn values(&self, namespace: &str) -> Result<Vec<Value>, StoreError>;

    /// Remove a whole namespace
    async fn clear(&self, namespace: &str) -> Result<(), StoreError>;
}

type Namespace = BTreeMap<String, Value>;

/// In-memory store, lost on exit
#[derive(Default)]
pub struct MemoryStore {
    namespaces: parking_lot::Mutex<HashMap<String, Namespace>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let namespaces = self.namespaces.lock();
        Ok(namespaces.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let mut namespaces = self.namespaces.lock();
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let mut namespaces = self.namespaces.lock();
        if let Some(ns) = namespaces.get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    async fn values(&self, namespace: &str) -> Result<Vec<Value>, StoreError> {
        let namespaces = self.namespaces.lock();
        Ok(namespaces
            .get(namespace)
            .map(|ns| ns.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, namespace: &str) -> Result<(), StoreError> {
        self.namespaces.lock().remove(namespace);
        Ok(())
    }
}

/// One JSON file per namespace under a directory
///
/// Writes go to a temp file that is renamed over the old one, so a crash
/// never leaves a half-written namespace behind.
pub struct JsonFileStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn namespace_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{}.json", namespace))
    }

    async fn load(&self, namespace: &str) -> Result<Namespace, StoreError> {
        match tokio::fs::read(self.namespace_path(namespace)).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Namespace::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, namespace: &str, data: &Namespace) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.namespace_path(namespace);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(data)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.load(namespace).await?.remove(key))
    }

    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.load(namespace).await?;
        data.insert(key.to_string(), value);
        self.save(namespace, &data).await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.load(namespace).await?;
        if data.remove(key).is_some() {
            self.save(namespace, &data).await?;
        }
        Ok(())
    }

    async fn values(&self, namespace: &str) -> Result<Vec<Value>, StoreError> {
        Ok(self.load(namespace).await?.into_values().collect())
    }

    async fn clear(&self, namespace: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.namespace_path(namespace)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Resumption Pointers
// ============================================================================

const POINTERS_NAMESPACE: &str = "resume";
const HISTORY_NAMESPACE: &str = "history";

/// Where an upload of a given fingerprint left off
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumptionPointer {
    pub session_id: Uuid,
    pub original_name: String,
    pub last_known_state: SessionState,
}

/// Fingerprint -> pointer map
#[derive(Clone)]
pub struct ResumePointers {
    store: Arc<dyn KeyValueStore>,
}

impl ResumePointers {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, fingerprint: &str) -> Result<Option<ResumptionPointer>, StoreError> {
        match self.store.get(POINTERS_NAMESPACE, fingerprint).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, fingerprint: &str, pointer: &ResumptionPointer) -> Result<(), StoreError> {
        self.store
            .put(POINTERS_NAMESPACE, fingerprint, serde_json::to_value(pointer)?)
            .await
    }

    pub async fn remove(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.store.delete(POINTERS_NAMESPACE, fingerprint).await
    }
}

// ============================================================================
// Upload History
// ============================================================================

/// How an upload ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryStatus {
    Completed,
    Failed,
    Cancelled,
}

/// One finished upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub filename: String,
    pub size: u64,
    pub status: HistoryStatus,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only log of finished uploads
#[derive(Clone)]
pub struct HistoryLog {
    store: Arc<dyn KeyValueStore>,
}

impl HistoryLog {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        let key = Uuid::new_v4().to_string();
        self.store
            .put(HISTORY_NAMESPACE, &key, serde_json::to_value(entry)?)
            .await
    }

    /// All entries, newest first
    pub async fn entries(&self) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut entries = self
            .store
            .values(HISTORY_NAMESPACE)
            .await?
            .into_iter()
            .map(serde_json::from_value::<HistoryEntry>)
            .collect::<Result<Vec<_>, _>>()?;

        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.clear(HISTORY_NAMESPACE).await
    }
}
