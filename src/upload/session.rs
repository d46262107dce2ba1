//! Upload Session Manager
//!
//! Owns the session state machine:
//! - Init-or-resume keyed by content fingerprint, with blob reconciliation
//! - Idempotent chunk admission at byte offsets
//! - Finalize guarded by a compare-and-swap on session state
//! - Purging of expired incomplete sessions
//!
//! All mutual exclusion lives in the registry's conditional updates. Chunk
//! writes for one session never take a lock because their byte ranges are
//! disjoint by construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::types::{
    ChunkAdmitted, FinalizeResponse, InitOutcome, InitRequest, InitResponse, SessionState,
    StatusResponse, UploadError, UploadSession,
};
use super::verifier::{self, Verification, VerifyError};
use crate::db::{ChunkRepository, SessionRepository};
use crate::storage::{BlobArea, BlobStore, StorageError};

// ============================================================================
// Session Manager
// ============================================================================

/// Manages upload sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    /// Session registry
    db: SqlitePool,

    /// Blob storage for incoming and completed files
    store: Arc<dyn BlobStore>,

    /// Chunk size new sessions are created with
    chunk_size: u64,

    verification_runs: AtomicU64,
    purged_sessions: AtomicU64,
}

/// Counters exposed for health reporting and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    /// Finalize calls that won the state transition and ran verification
    pub verification_runs: u64,
    /// Sessions removed by expiration
    pub purged_sessions: u64,
}

/// Outcome of one expiration pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub purged: usize,
    /// Completed between listing and deletion, left alone
    pub skipped: usize,
    pub failed: usize,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(db: SqlitePool, store: Arc<dyn BlobStore>, chunk_size: u64) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                db,
                store,
                chunk_size,
                verification_runs: AtomicU64::new(0),
                purged_sessions: AtomicU64::new(0),
            }),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.inner.chunk_size
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            verification_runs: self.inner.verification_runs.load(Ordering::Relaxed),
            purged_sessions: self.inner.purged_sessions.load(Ordering::Relaxed),
        }
    }

    fn sessions(&self) -> SessionRepository<'_> {
        SessionRepository::new(&self.inner.db)
    }

    fn chunks(&self) -> ChunkRepository<'_> {
        ChunkRepository::new(&self.inner.db)
    }

    /// Get a session by ID
    pub async fn get_session(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        self.sessions()
            .get(id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))
    }

    /// Get a session by string ID
    pub async fn get_session_by_str(&self, id: &str) -> Result<UploadSession, UploadError> {
        let uuid = Uuid::parse_str(id).map_err(|_| UploadError::SessionNotFound(id.to_string()))?;
        self.get_session(uuid).await
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Create a session for a new fingerprint, or resume the existing one
    pub async fn init_or_resume(&self, request: &InitRequest) -> Result<InitResponse, UploadError> {
        request.validate(self.inner.chunk_size)?;

        if let Some(existing) = self.sessions().find_by_fingerprint(&request.fingerprint).await? {
            return self.resume(existing).await;
        }

        let session = UploadSession::new(request, self.inner.chunk_size);
        let key = session.blob_key();

        // Allocate before the record exists so a visible session always has a blob
        self.inner.store.create_blob(&key, session.total_size).await?;

        let inserted = match self.sessions().insert_if_absent(&session).await {
            Ok(inserted) => inserted,
            Err(e) => {
                self.discard_blob(&key, BlobArea::Incoming).await;
                return Err(e.into());
            }
        };

        if !inserted {
            // Lost a race against a concurrent init for the same fingerprint
            self.discard_blob(&key, BlobArea::Incoming).await;
            let existing = self
                .sessions()
                .find_by_fingerprint(&request.fingerprint)
                .await?
                .ok_or_else(|| {
                    UploadError::Internal(format!(
                        "Fingerprint {} vanished during init",
                        request.fingerprint
                    ))
                })?;
            return self.resume(existing).await;
        }

        tracing::info!(
            session_id = %session.id,
            file_name = %session.original_name,
            total_size = session.total_size,
            chunks = session.chunk_count,
            "Created upload session"
        );

        Ok(InitResponse {
            outcome: InitOutcome::Initialized,
            session_id: session.id,
        })
    }

    async fn resume(&self, session: UploadSession) -> Result<InitResponse, UploadError> {
        if session.state == SessionState::Completed {
            tracing::info!(session_id = %session.id, "File already uploaded");
            return Ok(InitResponse {
                outcome: InitOutcome::AlreadyComplete,
                session_id: session.id,
            });
        }

        let key = session.blob_key();
        let store = &self.inner.store;
        let blob_present = store.exists(&key, BlobArea::Incoming).await?
            || store.exists(&key, BlobArea::Completed).await?;

        if !blob_present {
            // The file is gone, so every recorded chunk is meaningless
            tracing::warn!(
                session_id = %session.id,
                state = %session.state,
                "Blob missing, discarding chunk progress"
            );
            self.sessions().reset_to_uploading(session.id).await?;
            self.chunks().delete_for_session(session.id).await?;
            store.create_blob(&key, session.total_size).await?;
        } else {
            tracing::info!(session_id = %session.id, state = %session.state, "Resuming upload session");
        }

        Ok(InitResponse {
            outcome: InitOutcome::Resumable,
            session_id: session.id,
        })
    }

    /// Status of the session owning a fingerprint
    pub async fn status_by_fingerprint(&self, fingerprint: &str) -> Result<StatusResponse, UploadError> {
        let session = self
            .sessions()
            .find_by_fingerprint(fingerprint)
            .await?
            .ok_or_else(|| UploadError::NotFound(format!("No session for fingerprint {}", fingerprint)))?;

        self.status_of(session).await
    }

    /// Status of a session by ID
    pub async fn chunk_status(&self, session_id: Uuid) -> Result<StatusResponse, UploadError> {
        let session = self.get_session(session_id).await?;
        self.status_of(session).await
    }

    async fn status_of(&self, session: UploadSession) -> Result<StatusResponse, UploadError> {
        let received_chunks = self.chunks().received_indices(session.id).await?;

        Ok(StatusResponse {
            session_id: session.id,
            state: session.state,
            received_chunks,
            total_chunks: session.chunk_count,
            session,
        })
    }

    // ========================================================================
    // Chunk Admission
    // ========================================================================

    /// Durably record one chunk.
    ///
    /// Re-admitting a recorded chunk succeeds without touching the blob.
    pub async fn admit_chunk(
        &self,
        session_id: Uuid,
        chunk_index: u64,
        data: &[u8],
    ) -> Result<ChunkAdmitted, UploadError> {
        let session = self.get_session(session_id).await?;
        let admitted = ChunkAdmitted {
            accepted: true,
            chunk_index,
        };

        if self.chunks().exists(session_id, chunk_index).await? {
            tracing::debug!(session_id = %session_id, chunk_index = chunk_index, "Chunk already admitted");
            return Ok(admitted);
        }

        if session.state != SessionState::Uploading {
            return Err(UploadError::InvalidState {
                session_id,
                state: session.state,
            });
        }

        let range = session.chunk_range(chunk_index).ok_or_else(|| {
            UploadError::Validation(format!(
                "chunk index {} out of range (chunkCount {})",
                chunk_index, session.chunk_count
            ))
        })?;

        let expected_len = range.end - range.start;
        if data.len() as u64 != expected_len {
            return Err(UploadError::Validation(format!(
                "chunk {} must be {} bytes, got {}",
                chunk_index,
                expected_len,
                data.len()
            )));
        }

        self.inner
            .store
            .write_range(&session.blob_key(), range.start, data)
            .await
            .map_err(|e| match e {
                StorageError::BlobNotFound(_) => UploadError::SessionNotFound(format!(
                    "{} (blob missing, re-initialize the upload)",
                    session_id
                )),
                other => other.into(),
            })?;

        if !self.chunks().upsert(session_id, chunk_index).await? {
            // Purged between lookup and write
            return Err(UploadError::SessionNotFound(session_id.to_string()));
        }

        tracing::debug!(
            session_id = %session_id,
            chunk_index = chunk_index,
            size = data.len(),
            "Chunk admitted"
        );

        Ok(admitted)
    }

    // ========================================================================
    // Finalize
    // ========================================================================

    /// Verify and complete a fully received session.
    ///
    /// Exactly one concurrent caller wins the transition into PROCESSING
    /// and runs verification; every other caller gets the state it
    /// observes after losing.
    pub async fn finalize(&self, session_id: Uuid) -> Result<FinalizeResponse, UploadError> {
        let session = self.get_session(session_id).await?;

        let won = self
            .sessions()
            .transition(
                session_id,
                &[SessionState::Uploading, SessionState::Failed],
                SessionState::Processing,
            )
            .await?;

        if !won {
            let current = self.get_session(session_id).await?;
            tracing::debug!(session_id = %session_id, state = %current.state, "Finalize already handled");
            return Ok(FinalizeResponse::from_session(&current));
        }

        let received = self.chunks().count(session_id).await?;
        if received != session.chunk_count {
            self.sessions()
                .transition(session_id, &[SessionState::Processing], SessionState::Uploading)
                .await?;

            tracing::warn!(
                session_id = %session_id,
                received = received,
                expected = session.chunk_count,
                "Finalize rejected, upload incomplete"
            );

            return Err(UploadError::IncompleteUpload {
                received,
                expected: session.chunk_count,
            });
        }

        self.inner.verification_runs.fetch_add(1, Ordering::Relaxed);

        // Detached so that a dropped request cannot strand the session in PROCESSING
        let manager = self.clone();
        tokio::spawn(async move { manager.verify_and_complete(session).await })
            .await
            .map_err(|e| UploadError::Internal(format!("Verification task failed: {}", e)))?
    }

    async fn verify_and_complete(&self, session: UploadSession) -> Result<FinalizeResponse, UploadError> {
        let session_id = session.id;

        let verification = match self.promote_and_verify(&session).await {
            Ok(verification) => verification,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Verification failed");
                self.sessions()
                    .transition(session_id, &[SessionState::Processing], SessionState::Failed)
                    .await?;
                return Err(UploadError::FinalizeFailed(e.to_string()));
            }
        };

        let completed = match self
            .sessions()
            .complete(session_id, &verification.digest, verification.manifest.as_deref())
            .await
        {
            Ok(completed) => completed,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to persist verification");
                if let Err(e) = self
                    .sessions()
                    .transition(session_id, &[SessionState::Processing], SessionState::Failed)
                    .await
                {
                    tracing::error!(session_id = %session_id, error = %e, "Failed to mark session failed");
                }
                return Err(e.into());
            }
        };

        if !completed {
            // Reset or purged while verifying
            let current = self.get_session(session_id).await?;
            return Ok(FinalizeResponse::from_session(&current));
        }

        tracing::info!(
            session_id = %session_id,
            file_name = %session.original_name,
            digest = %verification.digest,
            entries = verification.manifest.as_ref().map(|m| m.len()).unwrap_or(0),
            "Upload completed"
        );

        Ok(FinalizeResponse {
            state: SessionState::Completed,
            digest: Some(verification.digest),
            manifest: verification.manifest,
            download_url: Some(session.download_url()),
        })
    }

    async fn promote_and_verify(&self, session: &UploadSession) -> Result<Verification, VerifyError> {
        let key = session.blob_key();
        let store = self.inner.store.as_ref();

        // A previous failed verification may already have promoted the blob
        if store.exists(&key, BlobArea::Incoming).await? {
            store.promote(&key).await?;
        } else if !store.exists(&key, BlobArea::Completed).await? {
            return Err(StorageError::BlobNotFound(key).into());
        }

        verifier::verify_blob(store, &key, &session.original_name).await
    }

    // ========================================================================
    // Download
    // ========================================================================

    /// Open a completed session's file for reading.
    ///
    /// Unknown and unfinished sessions both report `NotFound`.
    pub async fn open_download(
        &self,
        session_id: Uuid,
    ) -> Result<(UploadSession, tokio::fs::File), UploadError> {
        let session = self
            .sessions()
            .get(session_id)
            .await?
            .filter(|s| s.state == SessionState::Completed)
            .ok_or_else(|| UploadError::NotFound(format!("No completed upload {}", session_id)))?;

        let file = self.inner.store.open_for_read(&session.blob_key()).await?;
        Ok((session, file))
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Return sessions stranded in PROCESSING by a crash to UPLOADING
    pub async fn recover_interrupted(&self) -> Result<u64, UploadError> {
        let recovered = self.sessions().recover_processing().await?;
        if recovered > 0 {
            tracing::info!(count = recovered, "Recovered interrupted finalizations");
        }
        Ok(recovered)
    }

    /// Remove every non-completed session created before `older_than`
    pub async fn purge_expired(&self, older_than: DateTime<Utc>) -> Result<PurgeReport, UploadError> {
        let stale = self.sessions().list_stale(older_than).await?;
        let mut report = PurgeReport::default();

        for session in stale {
            match self.purge_session(&session).await {
                Ok(true) => report.purged += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "Failed to purge session");
                    report.failed += 1;
                }
            }
        }

        self.inner
            .purged_sessions
            .fetch_add(report.purged as u64, Ordering::Relaxed);

        if report.purged > 0 {
            tracing::info!(count = report.purged, "Purged expired upload sessions");
        }

        Ok(report)
    }

    async fn purge_session(&self, session: &UploadSession) -> Result<bool, UploadError> {
        // The conditional delete is the guard against purging a session
        // that completed after it was listed
        if !self.sessions().delete_unless_completed(session.id).await? {
            return Ok(false);
        }

        self.chunks().delete_for_session(session.id).await?;

        let key = session.blob_key();
        self.discard_blob(&key, BlobArea::Incoming).await;
        self.discard_blob(&key, BlobArea::Completed).await;

        tracing::debug!(session_id = %session.id, state = %session.state, "Purged session");
        Ok(true)
    }

    /// Best-effort blob removal
    async fn discard_blob(&self, key: &str, area: BlobArea) {
        if let Err(e) = self.inner.store.delete(key, area).await {
            tracing::warn!(key = %key, area = ?area, error = %e, "Failed to delete blob");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
