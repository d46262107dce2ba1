//! Upload Orchestrator
//!
//! Drives one file through the protocol:
//!
//! ```text
//! Negotiate -> Plan -> Dispatch -> Finalize -> Done
//!                ^         |          |
//!                |         v          v
//!                +------ (gap) ---- Poll
//! ```
//!
//! Dispatch runs a fixed pool of workers over a shared queue of missing
//! chunk indices. Transient failures are retried with exponential backoff.
//! Pausing or cancelling is cooperative: in-flight attempts are abandoned
//! and their indices go back on the queue.

use std::collections::VecDeque;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::fingerprint::fingerprint_file;
use super::local_store::{
    HistoryEntry, HistoryLog, HistoryStatus, KeyValueStore, ResumePointers, ResumptionPointer,
    StoreError,
};
use super::progress::{ProgressCallback, ProgressTracker};
use super::transport::{TransportError, UploadTransport};
use crate::upload::{
    chunk_count_for, chunk_range, ErrorCode, InitOutcome, InitRequest, ManifestEntry,
    SessionState, StatusResponse, DEFAULT_CHUNK_SIZE,
};

// ============================================================================
// Configuration
// ============================================================================

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of concurrent chunk workers
    pub concurrency: usize,

    /// Retries per chunk after the first attempt
    pub max_retries: u32,

    /// Delay before retry `n` is `backoff_base * 2^n`
    pub backoff_base: Duration,

    /// Status polling period while the server verifies
    pub poll_interval: Duration,

    /// Polls before giving up on a verification
    pub max_polls: u32,

    /// Must equal the server's chunk size
    pub chunk_size: u64,

    /// Upper bound on plan/dispatch rounds for one upload
    pub max_replans: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            poll_interval: Duration::from_secs(2),
            max_polls: 300,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_replans: 5,
        }
    }
}

// ============================================================================
// Errors and Outcomes
// ============================================================================

/// Orchestrator errors
///
/// Every variant except `Source` leaves the server session resumable.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Cannot read {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Server storage is full: {0}")]
    StorageExhausted(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("{} chunk(s) failed after retries (last error: {last_error})", .failed.len())]
    ChunksFailed {
        failed: Vec<u64>,
        last_error: TransportError,
    },

    #[error("Upload still incomplete after {0} rounds")]
    StillIncomplete(u32),

    #[error("Server did not finish verifying in time")]
    PollTimeout,

    #[error("Server rejected the request: {0}")]
    Transport(#[from] TransportError),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Completed {
        session_id: Uuid,
        digest: Option<String>,
        manifest: Option<Vec<ManifestEntry>>,
        download_url: String,
        /// The server already had this file before the run
        already_complete: bool,
    },
    /// Stopped by [`UploadControl::pause`]; run again to resume
    Paused { session_id: Option<Uuid> },
    /// Stopped by [`UploadControl::cancel`]; local resume state dropped
    Cancelled { session_id: Option<Uuid> },
}

/// Pause/cancel handle for one run
#[derive(Debug, Clone, Default)]
pub struct UploadControl {
    token: CancellationToken,
    abandon: Arc<AtomicBool>,
}

impl UploadControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop after in-flight attempts, keeping resume state
    pub fn pause(&self) {
        self.token.cancel();
    }

    /// Stop after in-flight attempts and forget the upload locally
    pub fn cancel(&self) {
        self.abandon.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    fn is_abandoned(&self) -> bool {
        self.abandon.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Internals
// ============================================================================

/// The local file being uploaded
struct SourceFile {
    path: PathBuf,
    name: String,
    size: u64,
    fingerprint: String,
}

enum Phase {
    Negotiate,
    Plan,
    Dispatch(Vec<u64>),
    Finalize,
    Poll,
    Done(UploadOutcome),
}

enum ChunkResult {
    Admitted,
    Interrupted,
    Failed(TransportError),
}

/// Why a dispatch round ended
enum DispatchEnd {
    /// Queue empty, every chunk admitted
    Drained,
    /// Pause or cancel requested
    Stopped,
    /// A worker hit an error that ends the round for everyone
    Aborted(TransportError),
    /// Some chunks exhausted their retries
    ChunksFailed {
        failed: Vec<u64>,
        last_error: TransportError,
    },
    /// The local file could not be read
    SourceFailed(std::io::Error),
}

/// State shared by the workers of one dispatch round
struct Round<'a> {
    session_id: Uuid,
    source: &'a SourceFile,
    queue: Mutex<VecDeque<u64>>,
    abort: CancellationToken,
    failed: Mutex<Vec<(u64, TransportError)>>,
    fatal: Mutex<Option<TransportError>>,
    source_error: Mutex<Option<std::io::Error>>,
    tracker: &'a ProgressTracker,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Client-side upload driver
pub struct UploadOrchestrator {
    transport: Arc<dyn UploadTransport>,
    pointers: ResumePointers,
    history: HistoryLog,
    config: OrchestratorConfig,
    on_progress: Option<ProgressCallback>,
}

impl UploadOrchestrator {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        store: Arc<dyn KeyValueStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            transport,
            pointers: ResumePointers::new(store.clone()),
            history: HistoryLog::new(store),
            config,
            on_progress: None,
        }
    }

    /// Report progress after every confirmed chunk
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Finished uploads, newest first
    pub async fn history(&self) -> Result<Vec<HistoryEntry>, OrchestratorError> {
        Ok(self.history.entries().await?)
    }

    pub async fn clear_history(&self) -> Result<(), OrchestratorError> {
        Ok(self.history.clear().await?)
    }

    /// What the server knows about a local file
    pub async fn remote_status(&self, path: &Path) -> Result<StatusResponse, OrchestratorError> {
        let source = self.inspect(path).await?;
        Ok(self.transport.status(&source.fingerprint).await?)
    }

    /// Upload a file, resuming any earlier attempt
    pub async fn upload_file(
        &self,
        path: &Path,
        control: &UploadControl,
    ) -> Result<UploadOutcome, OrchestratorError> {
        let source = self.inspect(path).await?;

        tracing::info!(
            file = %source.name,
            size = source.size,
            fingerprint = %source.fingerprint,
            "Starting upload"
        );

        let result = self.drive(&source, control).await;

        let (status, digest, error) = match &result {
            Ok(UploadOutcome::Completed { digest, .. }) => (Some(HistoryStatus::Completed), digest.clone(), None),
            Ok(UploadOutcome::Cancelled { .. }) => (Some(HistoryStatus::Cancelled), None, None),
            Ok(UploadOutcome::Paused { .. }) => (None, None, None),
            Err(e) => (Some(HistoryStatus::Failed), None, Some(e.to_string())),
        };

        if let Some(status) = status {
            let entry = HistoryEntry {
                filename: source.name.clone(),
                size: source.size,
                status,
                fingerprint: source.fingerprint.clone(),
                digest,
                error,
                timestamp: Utc::now(),
            };
            if let Err(e) = self.history.record(&entry).await {
                tracing::warn!(error = %e, "Failed to record upload history");
            }
        }

        match &result {
            Ok(outcome) => tracing::info!(file = %source.name, outcome = ?outcome, "Upload finished"),
            Err(e) => tracing::warn!(file = %source.name, error = %e, "Upload failed"),
        }

        result
    }

    async fn inspect(&self, path: &Path) -> Result<SourceFile, OrchestratorError> {
        let source_error = |source| OrchestratorError::Source {
            path: path.to_path_buf(),
            source,
        };

        let size = tokio::fs::metadata(path).await.map_err(source_error)?.len();
        let fingerprint = fingerprint_file(path).await.map_err(source_error)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());

        Ok(SourceFile {
            path: path.to_path_buf(),
            name,
            size,
            fingerprint,
        })
    }

    /// Run the phase machine until it reaches `Done` or fails
    async fn drive(
        &self,
        source: &SourceFile,
        control: &UploadControl,
    ) -> Result<UploadOutcome, OrchestratorError> {
        let mut session_id: Option<Uuid> = None;
        let mut already_complete = false;
        let mut rounds = 0u32;
        let mut phase = Phase::Negotiate;

        loop {
            if control.is_stopped() && !matches!(phase, Phase::Done(_)) {
                phase = Phase::Done(self.stopped(source, session_id, control).await?);
            }

            phase = match phase {
                Phase::Done(outcome) => return Ok(outcome),

                Phase::Negotiate => {
                    let (id, complete) = self.negotiate(source).await?;
                    session_id = Some(id);
                    already_complete = complete;
                    Phase::Plan
                }

                Phase::Plan => {
                    rounds += 1;
                    if rounds > self.config.max_replans {
                        return Err(OrchestratorError::StillIncomplete(rounds - 1));
                    }

                    let id = self.session(session_id)?;
                    let status = self
                        .with_retries("status", || self.transport.session_status(id))
                        .await;

                    match status {
                        Ok(status) => self.plan(source, status, already_complete).await?,
                        Err(e) if is_stale_reference(&e) => {
                            self.forget_session(source).await?;
                            Phase::Negotiate
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                Phase::Dispatch(missing) => {
                    let id = self.session(session_id)?;
                    match self.dispatch(id, source, missing, control).await {
                        DispatchEnd::Drained => Phase::Finalize,
                        DispatchEnd::Stopped => Phase::Done(self.stopped(source, session_id, control).await?),
                        DispatchEnd::Aborted(e) => match e.code() {
                            Some(ErrorCode::InvalidState) => Phase::Plan,
                            _ if is_stale_reference(&e) => {
                                self.forget_session(source).await?;
                                Phase::Negotiate
                            }
                            _ => return Err(self.terminal(e)),
                        },
                        DispatchEnd::ChunksFailed { failed, last_error } => {
                            return Err(OrchestratorError::ChunksFailed { failed, last_error });
                        }
                        DispatchEnd::SourceFailed(e) => {
                            return Err(OrchestratorError::Source {
                                path: source.path.clone(),
                                source: e,
                            });
                        }
                    }
                }

                Phase::Finalize => {
                    let id = self.session(session_id)?;
                    self.finalize(id).await?
                }

                Phase::Poll => {
                    let id = self.session(session_id)?;
                    self.poll(id, control).await?
                }
            };
        }
    }

    fn session(&self, session_id: Option<Uuid>) -> Result<Uuid, OrchestratorError> {
        session_id.ok_or_else(|| {
            OrchestratorError::Transport(TransportError::Network("no session negotiated".to_string()))
        })
    }

    /// Find or create the server session; returns (id, already complete)
    async fn negotiate(&self, source: &SourceFile) -> Result<(Uuid, bool), OrchestratorError> {
        // A local pointer saves asking the server to look the fingerprint up
        if let Some(pointer) = self.pointers.get(&source.fingerprint).await? {
            tracing::debug!(session_id = %pointer.session_id, "Found resume pointer");
            match self
                .with_retries("status", || self.transport.session_status(pointer.session_id))
                .await
            {
                Ok(_) => return Ok((pointer.session_id, false)),
                Err(e) if is_stale_reference(&e) => self.forget_session(source).await?,
                Err(e) => return Err(e.into()),
            }
        }

        let request = InitRequest {
            file_name: source.name.clone(),
            fingerprint: source.fingerprint.clone(),
            total_size: source.size,
            chunk_count: chunk_count_for(source.size, self.config.chunk_size),
        };

        let response = self
            .with_retries("init", || self.transport.init(&request))
            .await?;

        tracing::info!(
            session_id = %response.session_id,
            outcome = ?response.outcome,
            "Session negotiated"
        );

        self.pointers
            .save(
                &source.fingerprint,
                &ResumptionPointer {
                    session_id: response.session_id,
                    original_name: source.name.clone(),
                    last_known_state: SessionState::Uploading,
                },
            )
            .await?;

        Ok((response.session_id, response.outcome == InitOutcome::AlreadyComplete))
    }

    async fn plan(
        &self,
        source: &SourceFile,
        status: StatusResponse,
        already_complete: bool,
    ) -> Result<Phase, OrchestratorError> {
        self.pointers
            .save(
                &source.fingerprint,
                &ResumptionPointer {
                    session_id: status.session_id,
                    original_name: source.name.clone(),
                    last_known_state: status.state,
                },
            )
            .await?;

        let phase = match status.state {
            SessionState::Completed => {
                self.pointers.remove(&source.fingerprint).await?;
                Phase::Done(UploadOutcome::Completed {
                    session_id: status.session_id,
                    download_url: status.session.download_url(),
                    digest: status.session.final_digest,
                    manifest: status.session.manifest,
                    already_complete,
                })
            }
            SessionState::Processing => Phase::Poll,
            SessionState::Uploading | SessionState::Failed => {
                let missing = status.missing_chunks();
                tracing::debug!(
                    session_id = %status.session_id,
                    received = status.received_chunks.len(),
                    missing = missing.len(),
                    "Planned upload"
                );
                if missing.is_empty() {
                    Phase::Finalize
                } else {
                    Phase::Dispatch(missing)
                }
            }
        };

        Ok(phase)
    }

    async fn finalize(&self, session_id: Uuid) -> Result<Phase, OrchestratorError> {
        match self.transport.finalize(session_id).await {
            Ok(response) => Ok(match response.state {
                SessionState::Completed | SessionState::Uploading => Phase::Plan,
                SessionState::Processing => Phase::Poll,
                SessionState::Failed => {
                    return Err(OrchestratorError::VerificationFailed(
                        "server reported FAILED".to_string(),
                    ))
                }
            }),
            Err(e) => match e.code() {
                Some(ErrorCode::IncompleteUpload) => {
                    // Benign: something we thought was admitted is not; re-plan
                    tracing::debug!(session_id = %session_id, error = %e, "Finalize found a gap");
                    Ok(Phase::Plan)
                }
                Some(ErrorCode::FinalizeError) => Err(OrchestratorError::VerificationFailed(e.to_string())),
                _ if e.is_transient() => {
                    // The server may still be verifying; watch instead of resending
                    tracing::debug!(session_id = %session_id, error = %e, "Finalize did not answer, polling");
                    Ok(Phase::Poll)
                }
                _ => Err(self.terminal(e)),
            },
        }
    }

    async fn poll(&self, session_id: Uuid, control: &UploadControl) -> Result<Phase, OrchestratorError> {
        for _ in 0..self.config.max_polls {
            tokio::select! {
                _ = control.token.cancelled() => return Ok(Phase::Plan),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let status = match self.transport.session_status(session_id).await {
                Ok(status) => status,
                Err(e) if e.is_transient() => continue,
                Err(e) => return Err(e.into()),
            };

            match status.state {
                SessionState::Processing => continue,
                SessionState::Failed => {
                    return Err(OrchestratorError::VerificationFailed(
                        "server reported FAILED".to_string(),
                    ))
                }
                SessionState::Completed | SessionState::Uploading => return Ok(Phase::Plan),
            }
        }

        Err(OrchestratorError::PollTimeout)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    async fn dispatch(
        &self,
        session_id: Uuid,
        source: &SourceFile,
        missing: Vec<u64>,
        control: &UploadControl,
    ) -> DispatchEnd {
        let missing_bytes: u64 = missing
            .iter()
            .filter_map(|i| chunk_range(*i, self.config.chunk_size, source.size))
            .map(|r| r.end - r.start)
            .sum();
        let tracker = ProgressTracker::new(source.size, source.size.saturating_sub(missing_bytes));

        let workers = self.config.concurrency.max(1).min(missing.len());
        let round = Round {
            session_id,
            source,
            queue: Mutex::new(missing.into_iter().collect()),
            abort: control.token.child_token(),
            failed: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
            source_error: Mutex::new(None),
            tracker: &tracker,
        };

        join_all((0..workers).map(|worker| self.worker(worker, &round))).await;

        if let Some(e) = round.source_error.into_inner() {
            return DispatchEnd::SourceFailed(e);
        }
        if let Some(e) = round.fatal.into_inner() {
            return DispatchEnd::Aborted(e);
        }
        if control.is_stopped() {
            return DispatchEnd::Stopped;
        }

        let mut failed = round.failed.into_inner();
        if let Some((_, last_error)) = failed.last().cloned() {
            failed.sort_by_key(|(i, _)| *i);
            return DispatchEnd::ChunksFailed {
                failed: failed.into_iter().map(|(i, _)| i).collect(),
                last_error,
            };
        }

        DispatchEnd::Drained
    }

    async fn worker(&self, worker: usize, round: &Round<'_>) {
        loop {
            if round.abort.is_cancelled() {
                break;
            }
            let Some(index) = round.queue.lock().pop_front() else {
                break;
            };
            let Some(range) = chunk_range(index, self.config.chunk_size, round.source.size) else {
                continue;
            };

            let data = match read_range(&round.source.path, range.start, range.end - range.start).await {
                Ok(data) => data,
                Err(e) => {
                    *round.source_error.lock() = Some(e);
                    round.abort.cancel();
                    break;
                }
            };
            let len = data.len() as u64;

            match self.send_chunk(round, index, data).await {
                ChunkResult::Admitted => {
                    let snapshot = round.tracker.confirm(len);
                    if let Some(callback) = &self.on_progress {
                        callback(&snapshot);
                    }
                }
                ChunkResult::Interrupted => {
                    // Put it back so the next run picks it up
                    round.queue.lock().push_front(index);
                    break;
                }
                ChunkResult::Failed(e) if is_round_fatal(&e) => {
                    tracing::warn!(worker, chunk_index = index, error = %e, "Chunk rejected, stopping dispatch");
                    {
                        let mut fatal = round.fatal.lock();
                        if fatal.is_none() {
                            *fatal = Some(e);
                        }
                    }
                    round.abort.cancel();
                    break;
                }
                ChunkResult::Failed(e) => {
                    tracing::warn!(worker, chunk_index = index, error = %e, "Chunk failed after retries");
                    round.failed.lock().push((index, e));
                    break;
                }
            }
        }
    }

    async fn send_chunk(&self, round: &Round<'_>, index: u64, data: Bytes) -> ChunkResult {
        let mut attempt = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                _ = round.abort.cancelled() => return ChunkResult::Interrupted,
                result = self.transport.admit_chunk(round.session_id, index, data.clone()) => result,
            };

            match result {
                Ok(_) => return ChunkResult::Admitted,
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        chunk_index = index,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying chunk"
                    );
                    tokio::select! {
                        _ = round.abort.cancelled() => return ChunkResult::Interrupted,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return ChunkResult::Failed(e),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.backoff_base.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Retry a non-chunk call on transient errors
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    tracing::debug!(call = what, attempt = attempt + 1, error = %e, "Retrying");
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn stopped(
        &self,
        source: &SourceFile,
        session_id: Option<Uuid>,
        control: &UploadControl,
    ) -> Result<UploadOutcome, OrchestratorError> {
        if control.is_abandoned() {
            self.pointers.remove(&source.fingerprint).await?;
            Ok(UploadOutcome::Cancelled { session_id })
        } else {
            Ok(UploadOutcome::Paused { session_id })
        }
    }

    async fn forget_session(&self, source: &SourceFile) -> Result<(), OrchestratorError> {
        tracing::info!(file = %source.name, "Server no longer knows the session, re-initializing");
        Ok(self.pointers.remove(&source.fingerprint).await?)
    }

    fn terminal(&self, e: TransportError) -> OrchestratorError {
        match e {
            TransportError::Rejected {
                code: ErrorCode::StorageExhausted,
                message,
                ..
            } => OrchestratorError::StorageExhausted(message),
            other => OrchestratorError::Transport(other),
        }
    }
}

/// The session reference is stale and the upload must re-init
fn is_stale_reference(e: &TransportError) -> bool {
    matches!(e.code(), Some(ErrorCode::SessionNotFound | ErrorCode::NotFound))
}

/// Errors that make further chunk uploads in this round pointless
fn is_round_fatal(e: &TransportError) -> bool {
    matches!(
        e.code(),
        Some(
            ErrorCode::StorageExhausted
                | ErrorCode::SessionNotFound
                | ErrorCode::NotFound
                | ErrorCode::InvalidState
                | ErrorCode::ValidationError
        )
    )
}

async fn read_range(path: &Path, offset: u64, len: u64) -> std::io::Result<Bytes> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
