//! End-to-end upload scenarios: client orchestrator against a real
//! session manager, in process and over HTTP.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use uuid::Uuid;

use chunkvault::client::{
    fingerprint_file, FaultyTransport, HttpTransport, InProcessTransport, MemoryStore,
    OrchestratorConfig, TransportError, UploadControl, UploadOrchestrator, UploadOutcome,
    UploadTransport,
};
use chunkvault::config::Config;
use chunkvault::db::create_pool;
use chunkvault::fault::{FaultConfig, FaultInjector};
use chunkvault::routes;
use chunkvault::state::AppState;
use chunkvault::storage::LocalBlobStore;
use chunkvault::upload::{
    chunk_count_for, ChunkAdmitted, ExpirationSweeper, FinalizeResponse, InitOutcome,
    InitRequest, InitResponse, SessionManager, SessionState, StatusResponse, UploadError,
    DEFAULT_CHUNK_SIZE,
};

struct Server {
    dir: TempDir,
    manager: SessionManager,
    pool: sqlx::SqlitePool,
}

async fn server(chunk_size: u64) -> Server {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("registry.db").display());
    let pool = create_pool(&url).await.unwrap();
    let store = LocalBlobStore::new(dir.path().join("vault"));
    store.ensure_layout().await.unwrap();

    Server {
        manager: SessionManager::new(pool.clone(), Arc::new(store), chunk_size),
        pool,
        dir,
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 977) % 256) as u8).collect()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

async fn write_source(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    tokio::fs::write(&path, data).await.unwrap();
    path
}

fn client_config(chunk_size: u64) -> OrchestratorConfig {
    OrchestratorConfig {
        chunk_size,
        backoff_base: Duration::from_millis(1),
        poll_interval: Duration::from_millis(10),
        ..OrchestratorConfig::default()
    }
}

async fn init_request(path: &PathBuf, chunk_size: u64) -> InitRequest {
    let size = tokio::fs::metadata(path).await.unwrap().len();
    InitRequest {
        file_name: path.file_name().unwrap().to_string_lossy().into_owned(),
        fingerprint: fingerprint_file(path).await.unwrap(),
        total_size: size,
        chunk_count: chunk_count_for(size, chunk_size),
    }
}

/// Counts chunk admissions passing through
struct Counting<T> {
    inner: T,
    admitted: AtomicU32,
}

impl<T> Counting<T> {
    fn new(inner: T) -> Arc<Self> {
        Arc::new(Self {
            inner,
            admitted: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl<T: UploadTransport> UploadTransport for Counting<T> {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, TransportError> {
        self.inner.init(request).await
    }

    async fn status(&self, fingerprint: &str) -> Result<StatusResponse, TransportError> {
        self.inner.status(fingerprint).await
    }

    async fn session_status(&self, session_id: Uuid) -> Result<StatusResponse, TransportError> {
        self.inner.session_status(session_id).await
    }

    async fn admit_chunk(
        &self,
        session_id: Uuid,
        chunk_index: u64,
        data: Bytes,
    ) -> Result<ChunkAdmitted, TransportError> {
        self.admitted.fetch_add(1, Ordering::SeqCst);
        self.inner.admit_chunk(session_id, chunk_index, data).await
    }

    async fn finalize(&self, session_id: Uuid) -> Result<FinalizeResponse, TransportError> {
        self.inner.finalize(session_id).await
    }
}

#[tokio::test]
async fn twelve_mib_file_uploads_in_three_chunks() {
    let srv = server(DEFAULT_CHUNK_SIZE).await;
    let data = patterned(12 * 1024 * 1024);
    let path = write_source(&srv.dir, "big.bin", &data).await;

    let transport = Counting::new(InProcessTransport::new(srv.manager.clone()));
    let orchestrator = UploadOrchestrator::new(
        transport.clone(),
        Arc::new(MemoryStore::new()),
        client_config(DEFAULT_CHUNK_SIZE),
    );

    let outcome = orchestrator.upload_file(&path, &UploadControl::new()).await.unwrap();
    let session_id = match outcome {
        UploadOutcome::Completed {
            session_id,
            digest,
            manifest,
            ..
        } => {
            assert_eq!(digest, Some(sha256_hex(&data)));
            assert_eq!(manifest, None);
            session_id
        }
        other => panic!("unexpected {:?}", other),
    };

    assert_eq!(transport.admitted.load(Ordering::SeqCst), 3);

    let session = srv.manager.get_session(session_id).await.unwrap();
    assert_eq!(session.chunk_count, 3);
    assert_eq!(session.state, SessionState::Completed);
    assert_eq!(srv.manager.stats().verification_runs, 1);

    let (_, file) = srv.manager.open_download(session_id).await.unwrap();
    assert_eq!(file.metadata().await.unwrap().len(), data.len() as u64);
}

#[tokio::test]
async fn resume_sends_only_missing_chunks() {
    const CHUNK: u64 = 1024;
    let srv = server(CHUNK).await;
    let data = patterned(5 * CHUNK as usize - 100);
    let path = write_source(&srv.dir, "partial.bin", &data).await;

    // An earlier client got chunks 0, 2 and 4 through before dying
    let request = init_request(&path, CHUNK).await;
    let init = srv.manager.init_or_resume(&request).await.unwrap();
    assert_eq!(init.outcome, InitOutcome::Initialized);
    for index in [0u64, 2, 4] {
        let start = (index * CHUNK) as usize;
        let end = (start + CHUNK as usize).min(data.len());
        srv.manager.admit_chunk(init.session_id, index, &data[start..end]).await.unwrap();
    }

    let status = srv.manager.status_by_fingerprint(&request.fingerprint).await.unwrap();
    assert_eq!(status.received_chunks, vec![0, 2, 4]);
    assert_eq!(status.missing_chunks(), vec![1, 3]);

    // A fresh client with no local state resumes from the server's view
    let transport = Counting::new(InProcessTransport::new(srv.manager.clone()));
    let outcome = UploadOrchestrator::new(transport.clone(), Arc::new(MemoryStore::new()), client_config(CHUNK))
        .upload_file(&path, &UploadControl::new())
        .await
        .unwrap();

    match outcome {
        UploadOutcome::Completed { session_id, digest, .. } => {
            assert_eq!(session_id, init.session_id);
            assert_eq!(digest, Some(sha256_hex(&data)));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(transport.admitted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn lost_blob_is_reconciled_on_resume() {
    const CHUNK: u64 = 64;
    let srv = server(CHUNK).await;
    let data = patterned(300);
    let path = write_source(&srv.dir, "lost.bin", &data).await;

    let request = init_request(&path, CHUNK).await;
    let init = srv.manager.init_or_resume(&request).await.unwrap();
    srv.manager.admit_chunk(init.session_id, 0, &data[..64]).await.unwrap();
    srv.manager.admit_chunk(init.session_id, 1, &data[64..128]).await.unwrap();

    let blob = srv
        .dir
        .path()
        .join("vault/incomplete")
        .join(format!("{}_{}", init.session_id, request.file_name));
    tokio::fs::remove_file(&blob).await.unwrap();

    let resumed = srv.manager.init_or_resume(&request).await.unwrap();
    assert_eq!(resumed.outcome, InitOutcome::Resumable);
    assert_eq!(resumed.session_id, init.session_id);

    let status = srv.manager.chunk_status(init.session_id).await.unwrap();
    assert!(status.received_chunks.is_empty());

    let outcome = UploadOrchestrator::new(
        Arc::new(InProcessTransport::new(srv.manager.clone())),
        Arc::new(MemoryStore::new()),
        client_config(CHUNK),
    )
    .upload_file(&path, &UploadControl::new())
    .await
    .unwrap();

    match outcome {
        UploadOutcome::Completed { digest, .. } => assert_eq!(digest, Some(sha256_hex(&data))),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn concurrent_finalize_verifies_once() {
    const CHUNK: u64 = 128;
    let srv = server(CHUNK).await;
    let data = patterned(1000);
    let path = write_source(&srv.dir, "race.bin", &data).await;

    let request = init_request(&path, CHUNK).await;
    let init = srv.manager.init_or_resume(&request).await.unwrap();
    for (index, chunk) in data.chunks(CHUNK as usize).enumerate() {
        srv.manager.admit_chunk(init.session_id, index as u64, chunk).await.unwrap();
    }

    let (a, b) = tokio::join!(
        srv.manager.finalize(init.session_id),
        srv.manager.finalize(init.session_id)
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert!(a.state == SessionState::Completed || b.state == SessionState::Completed);

    assert_eq!(srv.manager.stats().verification_runs, 1);

    let session = srv.manager.get_session(init.session_id).await.unwrap();
    assert_eq!(session.state, SessionState::Completed);
    assert_eq!(session.final_digest, Some(sha256_hex(&data)));

    // Late finalize is idempotent
    let late = srv.manager.finalize(init.session_id).await.unwrap();
    assert_eq!(late.state, SessionState::Completed);
    assert_eq!(srv.manager.stats().verification_runs, 1);
}

#[tokio::test]
async fn sweeper_purges_abandoned_sessions_only() {
    const CHUNK: u64 = 16;
    let srv = server(CHUNK).await;

    let finished = patterned(40);
    let finished_path = write_source(&srv.dir, "done.bin", &finished).await;
    let abandoned = patterned(50);
    let abandoned_path = write_source(&srv.dir, "abandoned.bin", &abandoned).await;

    let done = srv
        .manager
        .init_or_resume(&init_request(&finished_path, CHUNK).await)
        .await
        .unwrap();
    for (index, chunk) in finished.chunks(CHUNK as usize).enumerate() {
        srv.manager.admit_chunk(done.session_id, index as u64, chunk).await.unwrap();
    }
    srv.manager.finalize(done.session_id).await.unwrap();

    let stale = srv
        .manager
        .init_or_resume(&init_request(&abandoned_path, CHUNK).await)
        .await
        .unwrap();
    srv.manager.admit_chunk(stale.session_id, 0, &abandoned[..16]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    let sweeper = ExpirationSweeper::new(
        srv.manager.clone(),
        Duration::from_secs(3600),
        chrono::Duration::milliseconds(1),
    );
    let report = sweeper.sweep_once().await;
    assert_eq!(report.purged, 1);
    assert_eq!(report.failed, 0);

    assert!(matches!(
        srv.manager.get_session(stale.session_id).await,
        Err(UploadError::SessionNotFound(_))
    ));
    let kept = srv.manager.get_session(done.session_id).await.unwrap();
    assert_eq!(kept.state, SessionState::Completed);

    let leftover: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_chunks WHERE session_id = ?")
        .bind(stale.session_id.to_string())
        .fetch_one(&srv.pool)
        .await
        .unwrap();
    assert_eq!(leftover, 0);

    // Nothing left to do on a second pass
    assert_eq!(sweeper.sweep_once().await.purged, 0);
}

#[tokio::test]
async fn upload_survives_seeded_chunk_failures() {
    const CHUNK: u64 = 256;
    let srv = server(CHUNK).await;
    let data = patterned(10 * CHUNK as usize + 17);
    let path = write_source(&srv.dir, "chaos.bin", &data).await;

    let transport = FaultyTransport::new(
        InProcessTransport::new(srv.manager.clone()),
        FaultInjector::new(FaultConfig::failures_only(0.3, 7)),
    );
    let config = OrchestratorConfig {
        max_retries: 12,
        ..client_config(CHUNK)
    };

    let outcome = UploadOrchestrator::new(Arc::new(transport), Arc::new(MemoryStore::new()), config)
        .upload_file(&path, &UploadControl::new())
        .await
        .unwrap();

    match outcome {
        UploadOutcome::Completed { digest, .. } => assert_eq!(digest, Some(sha256_hex(&data))),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn upload_over_http() {
    const CHUNK: u64 = 1000;
    let srv = server(CHUNK).await;
    let data = patterned(4321);
    let path = write_source(&srv.dir, "over the wire.bin", &data).await;

    let mut config = Config::default();
    config.upload.chunk_size = CHUNK;
    let app = routes::router(AppState::new(config, srv.pool.clone(), srv.manager.clone()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let base = format!("http://{}", addr);
    let transport = HttpTransport::new(&base).unwrap();
    let orchestrator = UploadOrchestrator::new(
        Arc::new(transport),
        Arc::new(MemoryStore::new()),
        client_config(CHUNK),
    );

    let outcome = orchestrator.upload_file(&path, &UploadControl::new()).await.unwrap();
    let download_url = match outcome {
        UploadOutcome::Completed {
            digest,
            download_url,
            already_complete,
            ..
        } => {
            assert_eq!(digest, Some(sha256_hex(&data)));
            assert!(!already_complete);
            download_url
        }
        other => panic!("unexpected {:?}", other),
    };

    let status = orchestrator.remote_status(&path).await.unwrap();
    assert_eq!(status.state, SessionState::Completed);
    assert_eq!(status.received_chunks, vec![0, 1, 2, 3, 4]);

    let res = reqwest::get(format!("{}{}", base, download_url)).await.unwrap();
    assert!(res.status().is_success());
    let disposition = res
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(disposition, "attachment; filename=\"over%20the%20wire.bin\"");
    assert_eq!(res.bytes().await.unwrap().as_ref(), data.as_slice());

    server_task.abort();
}

#[tokio::test]
async fn restart_between_chunks_resumes() {
    let srv = server(DEFAULT_CHUNK_SIZE).await;
    let data = patterned(12 * 1024 * 1024);
    let path = write_source(&srv.dir, "restart.bin", &data).await;
    let request = init_request(&path, DEFAULT_CHUNK_SIZE).await;
    assert_eq!(request.chunk_count, 3);

    let chunks: Vec<&[u8]> = data.chunks(DEFAULT_CHUNK_SIZE as usize).collect();
    assert_eq!(chunks[2].len(), 2 * 1024 * 1024);

    let init = srv.manager.init_or_resume(&request).await.unwrap();
    srv.manager.admit_chunk(init.session_id, 0, chunks[0]).await.unwrap();
    srv.manager.admit_chunk(init.session_id, 1, chunks[1]).await.unwrap();

    // Same registry and vault, fresh manager
    let store = LocalBlobStore::new(srv.dir.path().join("vault"));
    let restarted = SessionManager::new(srv.pool.clone(), Arc::new(store), DEFAULT_CHUNK_SIZE);
    assert_eq!(restarted.recover_interrupted().await.unwrap(), 0);

    let resumed = restarted.init_or_resume(&request).await.unwrap();
    assert_eq!(resumed.outcome, InitOutcome::Resumable);
    assert_eq!(resumed.session_id, init.session_id);

    let status = restarted.status_by_fingerprint(&request.fingerprint).await.unwrap();
    assert_eq!(status.received_chunks, vec![0, 1]);

    restarted.admit_chunk(init.session_id, 2, chunks[2]).await.unwrap();
    let done = restarted.finalize(init.session_id).await.unwrap();
    assert_eq!(done.state, SessionState::Completed);
    assert_eq!(done.digest, Some(sha256_hex(&data)));
    assert!(!done.download_url.unwrap_or_default().is_empty());
}
