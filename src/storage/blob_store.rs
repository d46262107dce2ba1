//! Blob Store
//!
//! Byte-addressable storage for upload blobs. Writes land at arbitrary
//! offsets of a pre-sized blob and may arrive out of order and concurrently
//! (for disjoint ranges).

use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

// ============================================================================
// Errors
// ============================================================================

/// Storage-specific errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Failed to allocate blob {key} ({size} bytes): {reason}")]
    AllocationFailed {
        key: String,
        size: u64,
        reason: String,
    },

    #[error("Storage capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("Invalid blob key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Blob Store Trait
// ============================================================================

/// Area a blob lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobArea {
    /// Writable area for sessions that are still receiving chunks
    Incoming,
    /// Read-only area for promoted blobs
    Completed,
}

/// Trait for blob storage backends
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Pre-allocate a zero-filled blob of exactly `total_size` bytes in the
    /// incoming area. An existing blob under the same key is replaced.
    async fn create_blob(&self, key: &str, total_size: u64) -> Result<(), StorageError>;

    /// Write `data` at `offset` without touching any other byte
    async fn write_range(&self, key: &str, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    /// Move a blob from the incoming area to the completed area
    async fn promote(&self, key: &str) -> Result<(), StorageError>;

    /// Open a completed blob for reading from the start
    async fn open_for_read(&self, key: &str) -> Result<File, StorageError>;

    /// Check whether a blob exists in the given area
    async fn exists(&self, key: &str, area: BlobArea) -> Result<bool, StorageError>;

    /// Remove a blob. Absent blobs are not an error.
    async fn delete(&self, key: &str, area: BlobArea) -> Result<(), StorageError>;
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem blob storage
///
/// Layout under `base_path`:
/// - `incomplete/<key>`: blobs still receiving chunks
/// - `ready/<key>`: promoted blobs
pub struct LocalBlobStore {
    base_path: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Create both areas if they are missing
    pub async fn ensure_layout(&self) -> Result<(), StorageError> {
        fs::create_dir_all(self.area_dir(BlobArea::Incoming)).await?;
        fs::create_dir_all(self.area_dir(BlobArea::Completed)).await?;
        Ok(())
    }

    fn area_dir(&self, area: BlobArea) -> PathBuf {
        match area {
            BlobArea::Incoming => self.base_path.join("incomplete"),
            BlobArea::Completed => self.base_path.join("ready"),
        }
    }

    fn blob_path(&self, key: &str, area: BlobArea) -> Result<PathBuf, StorageError> {
        let is_single_component = !key.is_empty()
            && key != "."
            && key != ".."
            && !key.contains(['/', '\\', '\0']);
        if !is_single_component {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.area_dir(area).join(key))
    }
}

#[async_trait::async_trait]
impl BlobStore for LocalBlobStore {
    async fn create_blob(&self, key: &str, total_size: u64) -> Result<(), StorageError> {
        let path = self.blob_path(key, BlobArea::Incoming)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let allocation_failed = |e: std::io::Error| {
            if is_capacity_error(&e) {
                StorageError::CapacityExhausted(e.to_string())
            } else {
                StorageError::AllocationFailed {
                    key: key.to_string(),
                    size: total_size,
                    reason: e.to_string(),
                }
            }
        };

        let file = File::create(&path).await.map_err(allocation_failed)?;
        // Sparse on filesystems that support it
        file.set_len(total_size).await.map_err(allocation_failed)?;

        tracing::debug!(key = %key, total_size = total_size, "Allocated blob");
        Ok(())
    }

    async fn write_range(&self, key: &str, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let path = self.blob_path(key, BlobArea::Incoming)?;

        // No truncate, no create: the blob must already be allocated
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| classify(e, key))?;

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| classify(e, key))?;
        file.write_all(data).await.map_err(|e| classify(e, key))?;
        file.sync_data().await.map_err(|e| classify(e, key))?;

        Ok(())
    }

    async fn promote(&self, key: &str) -> Result<(), StorageError> {
        let from = self.blob_path(key, BlobArea::Incoming)?;
        let to = self.blob_path(key, BlobArea::Completed)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::rename(&from, &to).await.map_err(|e| classify(e, key))?;

        tracing::debug!(key = %key, "Promoted blob to completed area");
        Ok(())
    }

    async fn open_for_read(&self, key: &str) -> Result<File, StorageError> {
        let path = self.blob_path(key, BlobArea::Completed)?;
        File::open(&path).await.map_err(|e| classify(e, key))
    }

    async fn exists(&self, key: &str, area: BlobArea) -> Result<bool, StorageError> {
        let path = self.blob_path(key, area)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &str, area: BlobArea) -> Result<(), StorageError> {
        let path = self.blob_path(key, area)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(classify(e, key)),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Map an IO error onto the storage error taxonomy
fn classify(err: std::io::Error, key: &str) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::BlobNotFound(key.to_string())
    } else if is_capacity_error(&err) {
        StorageError::CapacityExhausted(err.to_string())
    } else {
        StorageError::Io(err)
    }
}

/// Whether an IO error means the medium is out of space or over quota
fn is_capacity_error(err: &std::io::Error) -> bool {
    if matches!(err.kind(), ErrorKind::StorageFull | ErrorKind::FileTooLarge) {
        return true;
    }
    // EDQUOT has no stable ErrorKind mapping on every toolchain
    #[cfg(target_os = "linux")]
    const EDQUOT: i32 = 122;
    #[cfg(not(target_os = "linux"))]
    const EDQUOT: i32 = 69;
    err.raw_os_error() == Some(EDQUOT)
}

// ============================================================================
// Tests
// ============================================================================
