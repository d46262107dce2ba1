//! Upload types for the resumable chunked-transfer protocol

use std::ops::Range;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::storage::StorageError;

// ============================================================================
// Constants
// ============================================================================

/// Protocol chunk size: 5MB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Incomplete sessions older than this are purged
pub const SESSION_EXPIRY_HOURS: i64 = 24;

/// Expiration sweep period: 1 hour
pub const SWEEP_INTERVAL_SECS: u64 = 60 * 60;

/// Longest blob key, bounded by a single filesystem path component
pub const MAX_BLOB_KEY_LEN: usize = 255;

/// Longest accepted original file name, in bytes.
///
/// Blob keys are `<session uuid>_<name>`, which spends 37 bytes on the prefix.
pub const MAX_FILE_NAME_LEN: usize = MAX_BLOB_KEY_LEN - 37;

/// Longest accepted fingerprint
pub const MAX_FINGERPRINT_LEN: usize = 128;

/// Base path of the HTTP API
pub const API_BASE: &str = "/api/v1/upload";

/// Number of chunks needed to cover `total_size` bytes
pub fn chunk_count_for(total_size: u64, chunk_size: u64) -> u64 {
    total_size.div_ceil(chunk_size)
}

/// Byte range covered by chunk `index`, or `None` if out of bounds
pub fn chunk_range(index: u64, chunk_size: u64, total_size: u64) -> Option<Range<u64>> {
    let start = index.checked_mul(chunk_size)?;
    if start >= total_size {
        return None;
    }
    Some(start..(start + chunk_size).min(total_size))
}

// ============================================================================
// Session Types
// ============================================================================

/// Session state
///
/// `Uploading -> Processing -> Completed`, or `Processing -> Failed`.
/// A failed session can be finalized again without re-uploading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Receiving chunks
    Uploading,
    /// Verification in progress
    Processing,
    /// Verified and promoted
    Completed,
    /// Verification failed
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "UPLOADING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl FromStr for SessionState {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPLOADING" => Ok(Self::Uploading),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(UploadError::Internal(format!("Unknown session state: {}", other))),
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a container-format artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub entry_name: String,
    pub size: u64,
    pub is_directory: bool,
}

/// Server-side record of one file transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// Unique session ID
    pub id: Uuid,

    /// Client-supplied display name
    pub original_name: String,

    /// Client-computed resumption key, unique across sessions
    pub fingerprint: String,

    /// Total file size in bytes
    pub total_size: u64,

    /// Number of chunks the file is split into
    pub chunk_count: u64,

    /// Chunk size the session was created with
    pub chunk_size: u64,

    /// Current state
    pub state: SessionState,

    /// SHA-256 of the assembled file, set once verified
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_digest: Option<String>,

    /// Entries of a container file, set once verified
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Vec<ManifestEntry>>,

    /// Session creation time (drives expiration)
    pub created_at: DateTime<Utc>,

    /// Last state change
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    /// Create a new session in the `Uploading` state
    pub fn new(request: &InitRequest, chunk_size: u64) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            original_name: request.file_name.clone(),
            fingerprint: request.fingerprint.clone(),
            total_size: request.total_size,
            chunk_count: request.chunk_count,
            chunk_size,
            state: SessionState::Uploading,
            final_digest: None,
            manifest: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Key of this session's blob in the blob store
    pub fn blob_key(&self) -> String {
        format!("{}_{}", self.id, self.original_name)
    }

    /// Byte range chunk `index` covers
    pub fn chunk_range(&self, index: u64) -> Option<Range<u64>> {
        chunk_range(index, self.chunk_size, self.total_size)
    }

    /// Where the completed file can be fetched
    pub fn download_url(&self) -> String {
        format!("{}/download/{}", API_BASE, self.id)
    }
}

/// Outcome of an init-or-resume call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitOutcome {
    /// A new session was created
    Initialized,
    /// A session exists and can continue
    Resumable,
    /// The file was already transferred and verified
    AlreadyComplete,
}

// ============================================================================
// Request / Response Types
// ============================================================================

/// Request to initialize or resume an upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InitRequest {
    /// Original file name
    pub file_name: String,

    /// Resumption key (see `client::fingerprint`)
    pub fingerprint: String,

    /// Total file size in bytes
    pub total_size: u64,

    /// Number of chunks, must match the server's chunk size
    pub chunk_count: u64,
}

impl InitRequest {
    /// Reject malformed requests before they reach the session manager
    pub fn validate(&self, chunk_size: u64) -> Result<(), UploadError> {
        if chunk_size == 0 {
            return Err(UploadError::Internal("server chunk size is zero".to_string()));
        }

        let name = self.file_name.as_str();
        if name.is_empty() || name.trim().is_empty() {
            return Err(UploadError::Validation("fileName must not be empty".to_string()));
        }
        if name.len() > MAX_FILE_NAME_LEN {
            return Err(UploadError::Validation(format!(
                "fileName longer than {} bytes",
                MAX_FILE_NAME_LEN
            )));
        }
        if name == "." || name == ".." || name.contains(['/', '\\']) || name.chars().any(char::is_control) {
            return Err(UploadError::Validation(format!("invalid fileName: {:?}", name)));
        }

        let fingerprint = self.fingerprint.as_str();
        if fingerprint.is_empty() || fingerprint.len() > MAX_FINGERPRINT_LEN {
            return Err(UploadError::Validation(format!(
                "fingerprint must be 1..={} characters",
                MAX_FINGERPRINT_LEN
            )));
        }
        if !fingerprint
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(UploadError::Validation(
                "fingerprint may only contain [A-Za-z0-9_-]".to_string(),
            ));
        }

        let expected = chunk_count_for(self.total_size, chunk_size);
        if self.chunk_count != expected {
            return Err(UploadError::Validation(format!(
                "chunkCount {} does not match totalSize {} at chunk size {} (expected {})",
                self.chunk_count, self.total_size, chunk_size, expected
            )));
        }

        Ok(())
    }
}

/// Response to an init-or-resume request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub outcome: InitOutcome,
    pub session_id: Uuid,
}

/// Query string of the status-by-fingerprint endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusQuery {
    pub fingerprint: String,
}

/// Session state plus the set of admitted chunks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub session_id: Uuid,
    pub state: SessionState,
    /// Admitted chunk indices, ascending
    pub received_chunks: Vec<u64>,
    pub total_chunks: u64,
    pub session: UploadSession,
}

impl StatusResponse {
    /// Chunk indices that still have to be sent
    pub fn missing_chunks(&self) -> Vec<u64> {
        let received: std::collections::HashSet<u64> =
            self.received_chunks.iter().copied().collect();
        (0..self.total_chunks)
            .filter(|i| !received.contains(i))
            .collect()
    }
}

/// Response after admitting a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAdmitted {
    pub accepted: bool,
    pub chunk_index: u64,
}

/// Response after a finalize call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub state: SessionState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Vec<ManifestEntry>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl FinalizeResponse {
    /// Build the response a caller observes for a session
    pub fn from_session(session: &UploadSession) -> Self {
        let completed = session.state == SessionState::Completed;
        Self {
            state: session.state,
            digest: session.final_digest.clone(),
            manifest: session.manifest.clone(),
            download_url: completed.then(|| session.download_url()),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Machine-readable error code carried in error bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    SessionNotFound,
    NotFound,
    InvalidState,
    StorageExhausted,
    IncompleteUpload,
    FinalizeError,
    StorageError,
    DatabaseError,
    InternalError,
    #[serde(other)]
    Unknown,
}

/// Error body returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
}

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Session {session_id} is {state}")]
    InvalidState { session_id: Uuid, state: SessionState },

    #[error("Server storage is full: {0}")]
    StorageExhausted(String),

    #[error("Incomplete upload. Received {received}/{expected} chunks")]
    IncompleteUpload { received: u64, expected: u64 },

    #[error("Finalize failed: {0}")]
    FinalizeFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState { .. } => StatusCode::CONFLICT,
            Self::StorageExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
            Self::IncompleteUpload { .. } => StatusCode::CONFLICT,
            Self::FinalizeFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::StorageExhausted(_) => ErrorCode::StorageExhausted,
            Self::IncompleteUpload { .. } => ErrorCode::IncompleteUpload,
            Self::FinalizeFailed(_) => ErrorCode::FinalizeError,
            Self::Storage(_) => ErrorCode::StorageError,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Build the JSON error body
    pub fn to_response(&self) -> ErrorResponse {
        let (received, expected) = match self {
            Self::IncompleteUpload { received, expected } => (Some(*received), Some(*expected)),
            _ => (None, None),
        };

        ErrorResponse {
            error: self.to_string(),
            code: self.code(),
            received,
            expected,
        }
    }
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::CapacityExhausted(msg) => Self::StorageExhausted(msg),
            e @ StorageError::AllocationFailed { .. } => Self::Storage(e.to_string()),
            StorageError::BlobNotFound(key) => Self::NotFound(format!("blob {}", key)),
            e @ StorageError::InvalidKey(_) => Self::Internal(e.to_string()),
            StorageError::Io(e) => Self::Storage(e.to_string()),
        }
    }
}

impl From<AppError> for UploadError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::NotFound(msg) => Self::NotFound(msg),
            AppError::BadRequest(msg) => Self::Validation(msg),
            AppError::Storage(e) => e.into(),
            AppError::Database(e) => Self::Database(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
