//! Expiration Sweeper
//!
//! Periodically purges incomplete sessions older than the expiry age.
//! Completed sessions are never touched.

use std::time::Duration;

use chrono::Utc;

use super::session::{PurgeReport, SessionManager};

/// Background task that purges abandoned uploads
pub struct ExpirationSweeper {
    manager: SessionManager,
    interval: Duration,
    max_age: chrono::Duration,
}

impl ExpirationSweeper {
    pub fn new(manager: SessionManager, interval: Duration, max_age: chrono::Duration) -> Self {
        Self {
            manager,
            interval,
            max_age,
        }
    }

    /// Run one pass. Errors are logged, never propagated.
    pub async fn sweep_once(&self) -> PurgeReport {
        let cutoff = Utc::now() - self.max_age;

        match self.manager.purge_expired(cutoff).await {
            Ok(report) => {
                if report.failed > 0 {
                    tracing::warn!(
                        purged = report.purged,
                        failed = report.failed,
                        "Expiration sweep finished with failures"
                    );
                }
                report
            }
            Err(e) => {
                tracing::error!(error = %e, "Expiration sweep failed");
                PurgeReport::default()
            }
        }
    }

    /// Start background sweep task
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval_secs = self.interval.as_secs(),
                max_age_hours = self.max_age.num_hours(),
                "Expiration sweeper started"
            );

            let mut interval = tokio::time::interval(self.interval);
            loop {
                interval.tick().await;
                self.sweep_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use crate::storage::LocalBlobStore;
    use crate::upload::{InitRequest, SessionState, UploadError};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn manager(dir: &TempDir) -> SessionManager {
        let url = format!("sqlite://{}", dir.path().join("registry.db").display());
        let pool = create_pool(&url).await.unwrap();
        let store = LocalBlobStore::new(dir.path().join("vault"));
        store.ensure_layout().await.unwrap();
        SessionManager::new(pool, Arc::new(store), 4)
    }

    fn request(fingerprint: &str) -> InitRequest {
        InitRequest {
            file_name: "f.bin".to_string(),
            fingerprint: fingerprint.to_string(),
            total_size: 4,
            chunk_count: 1,
        }
    }

    #[tokio::test]
    async fn test_sweep_respects_max_age() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let id = manager.init_or_resume(&request("fp-1")).await.unwrap().session_id;

        let patient = ExpirationSweeper::new(manager.clone(), Duration::from_secs(3600), chrono::Duration::hours(24));
        assert_eq!(patient.sweep_once().await.purged, 0);
        manager.get_session(id).await.unwrap();

        // Negative age puts the cutoff in the future
        let eager = ExpirationSweeper::new(manager.clone(), Duration::from_secs(3600), chrono::Duration::hours(-1));
        assert_eq!(eager.sweep_once().await.purged, 1);
        assert!(matches!(manager.get_session(id).await, Err(UploadError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_background_task_sweeps() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let stale = manager.init_or_resume(&request("fp-stale")).await.unwrap().session_id;

        let done = manager.init_or_resume(&request("fp-done")).await.unwrap().session_id;
        manager.admit_chunk(done, 0, b"abcd").await.unwrap();
        manager.finalize(done).await.unwrap();

        let handle = ExpirationSweeper::new(
            manager.clone(),
            Duration::from_millis(20),
            chrono::Duration::hours(-1),
        )
        .start();

        // First tick fires immediately
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        assert!(manager.get_session(stale).await.is_err());
        assert_eq!(manager.get_session(done).await.unwrap().state, SessionState::Completed);
        assert!(manager.stats().purged_sessions >= 1);
    }
}
