//! Upload Routes
//!
//! HTTP endpoints for the resumable chunked upload protocol.
//!
//! Endpoints:
//! - POST /api/v1/upload/init - Create or resume a session for a fingerprint
//! - GET /api/v1/upload/status?fingerprint=F - Session and admitted chunks by fingerprint
//! - GET /api/v1/upload/:session_id - Session and admitted chunks by ID
//! - POST /api/v1/upload/:session_id/chunks/:index - Upload a chunk (raw body)
//! - POST /api/v1/upload/:session_id/finalize - Verify and complete
//! - GET /api/v1/upload/download/:session_id - Download a completed file

use axum::{
    body::{Body, Bytes},
    extract::{
        rejection::{BytesRejection, JsonRejection, PathRejection, QueryRejection},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::state::AppState;
use crate::upload::{
    ChunkAdmitted, FinalizeResponse, InitRequest, InitResponse, SessionManager, StatusQuery,
    StatusResponse, UploadError,
};

/// Extra room on top of the chunk size for the chunk route body limit
const BODY_LIMIT_SLACK: usize = 64 * 1024;

// ============================================================================
// State
// ============================================================================

/// Upload-specific state
#[derive(Clone)]
pub struct UploadState {
    pub session_manager: SessionManager,
}

// ============================================================================
// Error Response
// ============================================================================

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = ?self.code(), error = %self, "Upload request failed");
        }

        (status, Json(self.to_response())).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router(state: UploadState) -> Router<AppState> {
    let chunk_limit = usize::try_from(state.session_manager.chunk_size())
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_SLACK);

    Router::new()
        .route("/init", post(init))
        .route("/status", get(status_by_fingerprint))
        .route("/download/:session_id", get(download))
        .route(
            "/:session_id/chunks/:index",
            post(admit_chunk).layer(DefaultBodyLimit::max(chunk_limit)),
        )
        .route("/:session_id/finalize", post(finalize))
        .route("/:session_id", get(session_status))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/upload/init
async fn init(
    State(state): State<UploadState>,
    payload: Result<Json<InitRequest>, JsonRejection>,
) -> Result<Json<InitResponse>, UploadError> {
    let Json(request) = payload.map_err(|e| UploadError::Validation(e.body_text()))?;
    let response = state.session_manager.init_or_resume(&request).await?;
    Ok(Json(response))
}

/// GET /api/v1/upload/status?fingerprint=F
async fn status_by_fingerprint(
    State(state): State<UploadState>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> Result<Json<StatusResponse>, UploadError> {
    let Query(query) = query.map_err(|e| UploadError::Validation(e.body_text()))?;
    let status = state
        .session_manager
        .status_by_fingerprint(&query.fingerprint)
        .await?;
    Ok(Json(status))
}

/// GET /api/v1/upload/:session_id
async fn session_status(
    State(state): State<UploadState>,
    Path(session_id): Path<String>,
) -> Result<Json<StatusResponse>, UploadError> {
    let session_id = parse_session_id(&session_id)?;
    let status = state.session_manager.chunk_status(session_id).await?;
    Ok(Json(status))
}

/// POST /api/v1/upload/:session_id/chunks/:index
///
/// The chunk data is the raw request body.
async fn admit_chunk(
    State(state): State<UploadState>,
    path: Result<Path<(String, u64)>, PathRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<ChunkAdmitted>, UploadError> {
    let Path((session_id, chunk_index)) = path.map_err(|e| UploadError::Validation(e.body_text()))?;
    let body = body.map_err(|e| UploadError::Validation(e.body_text()))?;
    let session_id = parse_session_id(&session_id)?;

    let admitted = state
        .session_manager
        .admit_chunk(session_id, chunk_index, &body)
        .await?;
    Ok(Json(admitted))
}

/// POST /api/v1/upload/:session_id/finalize
async fn finalize(
    State(state): State<UploadState>,
    Path(session_id): Path<String>,
) -> Result<Json<FinalizeResponse>, UploadError> {
    let session_id = parse_session_id(&session_id)?;
    let response = state.session_manager.finalize(session_id).await?;
    Ok(Json(response))
}

/// GET /api/v1/upload/download/:session_id
///
/// Streams the completed file under its original name.
async fn download(
    State(state): State<UploadState>,
    Path(session_id): Path<String>,
) -> Result<Response, UploadError> {
    let session_id = Uuid::parse_str(&session_id)
        .map_err(|_| UploadError::NotFound(format!("No completed upload {}", session_id)))?;
    let (session, file) = state.session_manager.open_download(session_id).await?;

    tracing::info!(session_id = %session_id, file_name = %session.original_name, "Serving download");

    let disposition = format!(
        "attachment; filename=\"{}\"",
        urlencoding::encode(&session.original_name)
    );
    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (header::CONTENT_DISPOSITION, disposition),
        (header::CONTENT_LENGTH, session.total_size.to_string()),
    ];

    Ok((StatusCode::OK, headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_session_id(raw: &str) -> Result<Uuid, UploadError> {
    Uuid::parse_str(raw).map_err(|_| UploadError::SessionNotFound(raw.to_string()))
}

// ============================================================================
// Tests
// ============================================================================
