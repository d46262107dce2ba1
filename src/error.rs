//! Error types for the ChunkVault server

use thiserror::Error;

use crate::storage::StorageError;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
///
/// Used by the registry and startup paths. Protocol-level failures are
/// expressed as [`crate::upload::UploadError`], which converts from this.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_converts() {
        let err: AppError = StorageError::BlobNotFound("abc_file.bin".to_string()).into();
        assert!(matches!(err, AppError::Storage(StorageError::BlobNotFound(_))));
        assert_eq!(err.to_string(), "Storage error: Blob not found: abc_file.bin");
    }
}
