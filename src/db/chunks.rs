//! Chunk admission records

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::format_timestamp;
use crate::error::Result;

/// Admitted chunk row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChunkRecord {
    pub session_id: String,
    pub chunk_index: i64,
    pub state: String,
    pub received_at: String,
}

/// Chunk repository
pub struct ChunkRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ChunkRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Whether chunk `index` of a session has been admitted
    pub async fn exists(&self, session_id: Uuid, index: u64) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM upload_chunks WHERE session_id = ? AND chunk_index = ?",
        )
        .bind(session_id.to_string())
        .bind(index as i64)
        .fetch_optional(self.pool)
        .await?;

        Ok(found.is_some())
    }

    /// Record chunk `index` as received. Concurrent duplicates collapse
    /// into one row.
    ///
    /// Returns false without writing when the session row is gone, so an
    /// admission racing a purge leaves nothing behind.
    pub async fn upsert(&self, session_id: Uuid, index: u64) -> Result<bool> {
        let id = session_id.to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO upload_chunks (session_id, chunk_index, state, received_at)
            SELECT ?, ?, 'RECEIVED', ?
            WHERE EXISTS (SELECT 1 FROM upload_sessions WHERE id = ?)
            ON CONFLICT(session_id, chunk_index) DO UPDATE SET
                state = excluded.state,
                received_at = excluded.received_at
            "#,
        )
        .bind(&id)
        .bind(index as i64)
        .bind(format_timestamp(Utc::now()))
        .bind(&id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All admitted chunks of a session, ascending by index
    pub async fn list(&self, session_id: Uuid) -> Result<Vec<ChunkRecord>> {
        let records = sqlx::query_as::<_, ChunkRecord>(
            r#"
            SELECT session_id, chunk_index, state, received_at
            FROM upload_chunks
            WHERE session_id = ?
            ORDER BY chunk_index
            "#,
        )
        .bind(session_id.to_string())
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Admitted chunk indices, ascending
    pub async fn received_indices(&self, session_id: Uuid) -> Result<Vec<u64>> {
        let indices: Vec<i64> = sqlx::query_scalar(
            "SELECT chunk_index FROM upload_chunks WHERE session_id = ? ORDER BY chunk_index",
        )
        .bind(session_id.to_string())
        .fetch_all(self.pool)
        .await?;

        Ok(indices.into_iter().map(|i| i as u64).collect())
    }

    /// Number of admitted chunks
    pub async fn count(&self, session_id: Uuid) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_chunks WHERE session_id = ?")
            .bind(session_id.to_string())
            .fetch_one(self.pool)
            .await?;

        Ok(count as u64)
    }

    /// Drop every chunk record of a session
    pub async fn delete_for_session(&self, session_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
            .bind(session_id.to_string())
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;
    use crate::db::SessionRepository;
    use crate::upload::{InitRequest, UploadSession};

    async fn open_session(pool: &SqlitePool, fingerprint: &str) -> Uuid {
        let request = InitRequest {
            file_name: "chunks.bin".to_string(),
            fingerprint: fingerprint.to_string(),
            total_size: 40,
            chunk_count: 10,
        };
        let session = UploadSession::new(&request, 4);
        assert!(SessionRepository::new(pool).insert_if_absent(&session).await.unwrap());
        session.id
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let (_dir, pool) = temp_pool().await;
        let repo = ChunkRepository::new(&pool);
        let session = open_session(&pool, "fp-upsert").await;

        assert!(repo.upsert(session, 2).await.unwrap());
        assert!(repo.upsert(session, 2).await.unwrap());
        assert!(repo.upsert(session, 0).await.unwrap());

        assert_eq!(repo.count(session).await.unwrap(), 2);
        assert_eq!(repo.received_indices(session).await.unwrap(), vec![0, 2]);
        assert!(repo.exists(session, 2).await.unwrap());
        assert!(!repo.exists(session, 1).await.unwrap());

        let records = repo.list(session).await.unwrap();
        assert!(records.iter().all(|r| r.state == "RECEIVED"));
    }

    #[tokio::test]
    async fn test_concurrent_upserts_leave_one_row() {
        let (_dir, pool) = temp_pool().await;
        let session = open_session(&pool, "fp-concurrent").await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                ChunkRepository::new(&pool).upsert(session, 5).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ChunkRepository::new(&pool).count(session).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_for_session_is_scoped() {
        let (_dir, pool) = temp_pool().await;
        let repo = ChunkRepository::new(&pool);
        let a = open_session(&pool, "fp-a").await;
        let b = open_session(&pool, "fp-b").await;

        for i in 0..3 {
            repo.upsert(a, i).await.unwrap();
        }
        repo.upsert(b, 0).await.unwrap();

        assert_eq!(repo.delete_for_session(a).await.unwrap(), 3);
        assert_eq!(repo.count(a).await.unwrap(), 0);
        assert_eq!(repo.count(b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_without_session_writes_nothing() {
        let (_dir, pool) = temp_pool().await;
        let repo = ChunkRepository::new(&pool);
        let orphan = Uuid::new_v4();

        assert!(!repo.upsert(orphan, 0).await.unwrap());
        assert_eq!(repo.count(orphan).await.unwrap(), 0);

        let session = open_session(&pool, "fp-purged").await;
        assert!(SessionRepository::new(&pool).delete_unless_completed(session).await.unwrap());
        assert!(!repo.upsert(session, 1).await.unwrap());
        assert_eq!(repo.count(session).await.unwrap(), 0);
    }
}
