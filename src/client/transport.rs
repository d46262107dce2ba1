//! Upload transports
//!
//! The orchestrator talks to a session manager through [`UploadTransport`].
//! [`HttpTransport`] speaks the HTTP API, [`InProcessTransport`] calls a
//! [`SessionManager`] directly, and [`FaultyTransport`] wraps either one
//! with seeded fault injection.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::CONTENT_TYPE, Client as HttpClient, Response};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::fault::FaultInjector;
use crate::upload::{
    ChunkAdmitted, ErrorCode, ErrorResponse, FinalizeResponse, InitRequest, InitResponse,
    SessionManager, StatusResponse, UploadError, API_BASE,
};

/// Timeout for ordinary requests
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for the initial finalize call; verifying a huge file is slow
pub const FINALIZE_TIMEOUT: Duration = Duration::from_secs(300);

// ============================================================================
// Errors
// ============================================================================

/// Transport errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The server answered with an error body
    #[error("HTTP {status} {code:?}: {message}")]
    Rejected {
        status: u16,
        code: ErrorCode,
        message: String,
        received: Option<u64>,
        expected: Option<u64>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,
}

impl TransportError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Rejected { status, code, .. } => match code {
                ErrorCode::InternalError | ErrorCode::DatabaseError | ErrorCode::StorageError => true,
                ErrorCode::Unknown => *status >= 500 || *status == 429,
                _ => false,
            },
        }
    }

    /// Server error code, if the server answered
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    fn from_body(status: u16, body: ErrorResponse) -> Self {
        Self::Rejected {
            status,
            code: body.code,
            message: body.error,
            received: body.received,
            expected: body.expected,
        }
    }
}

impl From<UploadError> for TransportError {
    fn from(err: UploadError) -> Self {
        Self::from_body(err.status_code().as_u16(), err.to_response())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err.to_string())
        }
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

/// The session manager operations the orchestrator needs
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Create or resume the session for a fingerprint
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, TransportError>;

    /// Session and admitted chunks by fingerprint
    async fn status(&self, fingerprint: &str) -> Result<StatusResponse, TransportError>;

    /// Session and admitted chunks by session ID
    async fn session_status(&self, session_id: Uuid) -> Result<StatusResponse, TransportError>;

    /// Admit one chunk
    async fn admit_chunk(
        &self,
        session_id: Uuid,
        chunk_index: u64,
        data: Bytes,
    ) -> Result<ChunkAdmitted, TransportError>;

    /// Verify and complete the session
    async fn finalize(&self, session_id: Uuid) -> Result<FinalizeResponse, TransportError>;
}

// ============================================================================
// HTTP Transport
// ============================================================================

/// Transport over the HTTP API
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// Base URL of the server, without trailing slash
    base_url: String,

    client: HttpClient,

    finalize_timeout: Duration,
}

impl HttpTransport {
    pub fn new(server_url: &str) -> Result<Self, TransportError> {
        Self::with_timeouts(server_url, REQUEST_TIMEOUT, FINALIZE_TIMEOUT)
    }

    pub fn with_timeouts(
        server_url: &str,
        request_timeout: Duration,
        finalize_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = HttpClient::builder()
            .timeout(request_timeout)
            .user_agent(concat!("chunkvault/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: server_url.trim_end_matches('/').to_string(),
            client,
            finalize_timeout,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_BASE, path)
    }
}

/// Decode a success body or turn the error body into a `TransportError`
async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, TransportError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res.json().await?);
    }

    let text = res.text().await.unwrap_or_default();
    let err = match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(body) => TransportError::from_body(status.as_u16(), body),
        Err(_) => TransportError::Rejected {
            status: status.as_u16(),
            code: ErrorCode::Unknown,
            message: if text.is_empty() { status.to_string() } else { text },
            received: None,
            expected: None,
        },
    };
    Err(err)
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, TransportError> {
        let res = self
            .client
            .post(self.endpoint("/init"))
            .json(request)
            .send()
            .await?;
        decode(res).await
    }

    async fn status(&self, fingerprint: &str) -> Result<StatusResponse, TransportError> {
        let res = self
            .client
            .get(self.endpoint("/status"))
            .query(&[("fingerprint", fingerprint)])
            .send()
            .await?;
        decode(res).await
    }

    async fn session_status(&self, session_id: Uuid) -> Result<StatusResponse, TransportError> {
        let res = self
            .client
            .get(self.endpoint(&format!("/{}", session_id)))
            .send()
            .await?;
        decode(res).await
    }

    async fn admit_chunk(
        &self,
        session_id: Uuid,
        chunk_index: u64,
        data: Bytes,
    ) -> Result<ChunkAdmitted, TransportError> {
        let res = self
            .client
            .post(self.endpoint(&format!("/{}/chunks/{}", session_id, chunk_index)))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;
        decode(res).await
    }

    async fn finalize(&self, session_id: Uuid) -> Result<FinalizeResponse, TransportError> {
        let res = self
            .client
            .post(self.endpoint(&format!("/{}/finalize", session_id)))
            .timeout(self.finalize_timeout)
            .send()
            .await?;
        decode(res).await
    }
}

// ============================================================================
// In-Process Transport
// ============================================================================

/// Transport that calls a session manager in the same process
#[derive(Clone)]
pub struct InProcessTransport {
    manager: SessionManager,
}

impl InProcessTransport {
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl UploadTransport for InProcessTransport {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, TransportError> {
        Ok(self.manager.init_or_resume(request).await?)
    }

    async fn status(&self, fingerprint: &str) -> Result<StatusResponse, TransportError> {
        Ok(self.manager.status_by_fingerprint(fingerprint).await?)
    }

    async fn session_status(&self, session_id: Uuid) -> Result<StatusResponse, TransportError> {
        Ok(self.manager.chunk_status(session_id).await?)
    }

    async fn admit_chunk(
        &self,
        session_id: Uuid,
        chunk_index: u64,
        data: Bytes,
    ) -> Result<ChunkAdmitted, TransportError> {
        Ok(self.manager.admit_chunk(session_id, chunk_index, &data).await?)
    }

    async fn finalize(&self, session_id: Uuid) -> Result<FinalizeResponse, TransportError> {
        Ok(self.manager.finalize(session_id).await?)
    }
}

// ============================================================================
// Fault Injection
// ============================================================================

/// Wraps a transport with injected latency and chunk failures
pub struct FaultyTransport<T> {
    inner: T,
    injector: FaultInjector,
}

impl<T: UploadTransport> FaultyTransport<T> {
    pub fn new(inner: T, injector: FaultInjector) -> Self {
        Self { inner, injector }
    }

    async fn inject(&self, can_fail: bool) -> Result<(), TransportError> {
        let decision = self.injector.decide(can_fail);
        if !decision.delay.is_zero() {
            tokio::time::sleep(decision.delay).await;
        }
        if decision.fail {
            return Err(UploadError::Internal("Injected fault".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl<T: UploadTransport> UploadTransport for FaultyTransport<T> {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, TransportError> {
        self.inject(false).await?;
        self.inner.init(request).await
    }

    async fn status(&self, fingerprint: &str) -> Result<StatusResponse, TransportError> {
        self.inject(false).await?;
        self.inner.status(fingerprint).await
    }

    async fn session_status(&self, session_id: Uuid) -> Result<StatusResponse, TransportError> {
        self.inject(false).await?;
        self.inner.session_status(session_id).await
    }

    async fn admit_chunk(
        &self,
        session_id: Uuid,
        chunk_index: u64,
        data: Bytes,
    ) -> Result<ChunkAdmitted, TransportError> {
        self.inject(true).await?;
        self.inner.admit_chunk(session_id, chunk_index, data).await
    }

    async fn finalize(&self, session_id: Uuid) -> Result<FinalizeResponse, TransportError> {
        self.inject(false).await?;
        self.inner.finalize(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultConfig;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Network("reset".to_string()).is_transient());

        let injected: TransportError = UploadError::Internal("boom".to_string()).into();
        assert!(injected.is_transient());

        let full: TransportError = UploadError::StorageExhausted("disk".to_string()).into();
        assert!(!full.is_transient());
        assert_eq!(full.code(), Some(ErrorCode::StorageExhausted));

        let gap: TransportError = UploadError::IncompleteUpload { received: 1, expected: 2 }.into();
        match gap {
            TransportError::Rejected { status, received, expected, .. } => {
                assert_eq!(status, 409);
                assert_eq!((received, expected), (Some(1), Some(2)));
            }
            other => panic!("unexpected {:?}", other),
        }

        let proxy = TransportError::Rejected {
            status: 502,
            code: ErrorCode::Unknown,
            message: "Bad Gateway".to_string(),
            received: None,
            expected: None,
        };
        assert!(proxy.is_transient());
    }

    #[test]
    fn test_endpoint_joins_base() {
        let transport = HttpTransport::new("http://localhost:5001/").unwrap();
        assert_eq!(
            transport.endpoint("/init"),
            "http://localhost:5001/api/v1/upload/init"
        );
    }

    struct Unreachable;

    #[async_trait]
    impl UploadTransport for Unreachable {
        async fn init(&self, _: &InitRequest) -> Result<InitResponse, TransportError> {
            Err(TransportError::Network("unreachable".to_string()))
        }
        async fn status(&self, _: &str) -> Result<StatusResponse, TransportError> {
            Err(TransportError::Network("unreachable".to_string()))
        }
        async fn session_status(&self, _: Uuid) -> Result<StatusResponse, TransportError> {
            Err(TransportError::Network("unreachable".to_string()))
        }
        async fn admit_chunk(&self, _: Uuid, i: u64, _: Bytes) -> Result<ChunkAdmitted, TransportError> {
            Ok(ChunkAdmitted { accepted: true, chunk_index: i })
        }
        async fn finalize(&self, _: Uuid) -> Result<FinalizeResponse, TransportError> {
            Err(TransportError::Network("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_faulty_transport_fails_chunks_only() {
        let faulty = FaultyTransport::new(Unreachable, FaultInjector::new(FaultConfig::failures_only(1.0, 3)));

        let chunk = faulty.admit_chunk(Uuid::new_v4(), 0, Bytes::from_static(b"x")).await;
        assert!(matches!(
            chunk,
            Err(TransportError::Rejected { code: ErrorCode::InternalError, .. })
        ));

        // Non-chunk calls reach the inner transport
        let init = faulty
            .init(&InitRequest {
                file_name: "a".to_string(),
                fingerprint: "f-1".to_string(),
                total_size: 1,
                chunk_count: 1,
            })
            .await;
        assert!(matches!(init, Err(TransportError::Network(_))));

        let clean = FaultyTransport::new(Unreachable, FaultInjector::disabled());
        let ok = clean.admit_chunk(Uuid::new_v4(), 4, Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(ok.chunk_index, 4);
    }
}
