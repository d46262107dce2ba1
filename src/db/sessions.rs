//! Upload session database operations

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{format_timestamp, parse_timestamp};
use crate::error::{AppError, Result};
use crate::upload::{ManifestEntry, SessionState, UploadSession};

/// Upload session row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRecord {
    pub id: String,
    pub original_name: String,
    pub fingerprint: String,
    pub total_size: i64,
    pub chunk_count: i64,
    pub chunk_size: i64,
    pub state: String,
    pub final_digest: Option<String>,
    pub manifest: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<SessionRecord> for UploadSession {
    type Error = AppError;

    fn try_from(row: SessionRecord) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| AppError::Internal(format!("Bad session id {:?}: {}", row.id, e)))?;
        let state = row
            .state
            .parse::<SessionState>()
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let manifest = row
            .manifest
            .as_deref()
            .map(serde_json::from_str::<Vec<ManifestEntry>>)
            .transpose()?;

        Ok(UploadSession {
            id,
            original_name: row.original_name,
            fingerprint: row.fingerprint,
            total_size: row.total_size as u64,
            chunk_count: row.chunk_count as u64,
            chunk_size: row.chunk_size as u64,
            state,
            final_digest: row.final_digest,
            manifest,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

const SELECT_SESSION: &str = r#"
    SELECT id, original_name, fingerprint, total_size, chunk_count, chunk_size,
           state, final_digest, manifest, created_at, updated_at
    FROM upload_sessions
"#;

/// Session repository
pub struct SessionRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SessionRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a session by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<UploadSession>> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!("{} WHERE id = ?", SELECT_SESSION))
            .bind(id.to_string())
            .fetch_optional(self.pool)
            .await?;

        record.map(UploadSession::try_from).transpose()
    }

    /// Get the session that owns a fingerprint
    pub async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<UploadSession>> {
        let record =
            sqlx::query_as::<_, SessionRecord>(&format!("{} WHERE fingerprint = ?", SELECT_SESSION))
                .bind(fingerprint)
                .fetch_optional(self.pool)
                .await?;

        record.map(UploadSession::try_from).transpose()
    }

    /// Insert a new session unless its fingerprint is already taken.
    ///
    /// Returns false when another session owns the fingerprint.
    pub async fn insert_if_absent(&self, session: &UploadSession) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO upload_sessions (id, original_name, fingerprint, total_size, chunk_count,
                                         chunk_size, state, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
        )
        .bind(session.id.to_string())
        .bind(&session.original_name)
        .bind(&session.fingerprint)
        .bind(session.total_size as i64)
        .bind(session.chunk_count as i64)
        .bind(session.chunk_size as i64)
        .bind(session.state.as_str())
        .bind(format_timestamp(session.created_at))
        .bind(format_timestamp(session.updated_at))
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Compare-and-swap the session state.
    ///
    /// Succeeds only if the current state is one of `from`.
    pub async fn transition(&self, id: Uuid, from: &[SessionState], to: SessionState) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }

        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE upload_sessions SET state = ?, updated_at = ? WHERE id = ? AND state IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(format_timestamp(Utc::now()))
            .bind(id.to_string());
        for state in from {
            query = query.bind(state.as_str());
        }

        let result = query.execute(self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Return a session to UPLOADING and forget any verification result
    pub async fn reset_to_uploading(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET state = 'UPLOADING', final_digest = NULL, manifest = NULL, updated_at = ?
            WHERE id = ? AND state != 'COMPLETED'
            "#,
        )
        .bind(format_timestamp(Utc::now()))
        .bind(id.to_string())
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a successful verification: PROCESSING -> COMPLETED
    pub async fn complete(
        &self,
        id: Uuid,
        digest: &str,
        manifest: Option<&[ManifestEntry]>,
    ) -> Result<bool> {
        let manifest_json = manifest.map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET state = 'COMPLETED', final_digest = ?, manifest = ?, updated_at = ?
            WHERE id = ? AND state = 'PROCESSING'
            "#,
        )
        .bind(digest)
        .bind(manifest_json)
        .bind(format_timestamp(Utc::now()))
        .bind(id.to_string())
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Move every PROCESSING session back to UPLOADING
    pub async fn recover_processing(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions SET state = 'UPLOADING', updated_at = ?
            WHERE state = 'PROCESSING'
            "#,
        )
        .bind(format_timestamp(Utc::now()))
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Non-completed sessions created before `cutoff`
    pub async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadSession>> {
        let records = sqlx::query_as::<_, SessionRecord>(&format!(
            "{} WHERE state != 'COMPLETED' AND created_at < ? ORDER BY created_at",
            SELECT_SESSION
        ))
        .bind(format_timestamp(cutoff))
        .fetch_all(self.pool)
        .await?;

        records.into_iter().map(UploadSession::try_from).collect()
    }

    /// Delete a session unless it completed in the meantime
    pub async fn delete_unless_completed(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE id = ? AND state != 'COMPLETED'")
            .bind(id.to_string())
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;
    use crate::upload::InitRequest;

    fn session(fingerprint: &str) -> UploadSession {
        UploadSession::new(
            &InitRequest {
                file_name: "photos.zip".to_string(),
                fingerprint: fingerprint.to_string(),
                total_size: 12,
                chunk_count: 3,
            },
            4,
        )
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let (_dir, pool) = temp_pool().await;
        let repo = SessionRepository::new(&pool);
        let s = session("fp-1");

        assert!(repo.insert_if_absent(&s).await.unwrap());

        let by_id = repo.get(s.id).await.unwrap().unwrap();
        assert_eq!(by_id.fingerprint, "fp-1");
        assert_eq!(by_id.state, SessionState::Uploading);
        assert_eq!(by_id.chunk_size, 4);

        let by_fp = repo.find_by_fingerprint("fp-1").await.unwrap().unwrap();
        assert_eq!(by_fp.id, s.id);
        assert!(repo.find_by_fingerprint("fp-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fingerprint_is_unique() {
        let (_dir, pool) = temp_pool().await;
        let repo = SessionRepository::new(&pool);

        assert!(repo.insert_if_absent(&session("fp-dup")).await.unwrap());
        assert!(!repo.insert_if_absent(&session("fp-dup")).await.unwrap());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let (_dir, pool) = temp_pool().await;
        let repo = SessionRepository::new(&pool);
        let s = session("fp-cas");
        repo.insert_if_absent(&s).await.unwrap();

        let from = [SessionState::Uploading, SessionState::Failed];
        assert!(repo.transition(s.id, &from, SessionState::Processing).await.unwrap());
        assert!(!repo.transition(s.id, &from, SessionState::Processing).await.unwrap());

        let manifest = vec![ManifestEntry {
            entry_name: "a.txt".to_string(),
            size: 3,
            is_directory: false,
        }];
        assert!(repo.complete(s.id, "abc123", Some(&manifest)).await.unwrap());

        let done = repo.get(s.id).await.unwrap().unwrap();
        assert_eq!(done.state, SessionState::Completed);
        assert_eq!(done.final_digest.as_deref(), Some("abc123"));
        assert_eq!(done.manifest, Some(manifest));

        // Completed sessions are never reset or deleted
        assert!(!repo.reset_to_uploading(s.id).await.unwrap());
        assert!(!repo.delete_unless_completed(s.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_stale_skips_completed_and_recent() {
        let (_dir, pool) = temp_pool().await;
        let repo = SessionRepository::new(&pool);

        let mut old = session("fp-old");
        old.created_at = Utc::now() - chrono::Duration::hours(30);
        let mut old_done = session("fp-old-done");
        old_done.created_at = old.created_at;
        let fresh = session("fp-fresh");

        for s in [&old, &old_done, &fresh] {
            repo.insert_if_absent(s).await.unwrap();
        }
        repo.transition(old_done.id, &[SessionState::Uploading], SessionState::Processing)
            .await
            .unwrap();
        repo.complete(old_done.id, "d", None).await.unwrap();

        let stale = repo
            .list_stale(Utc::now() - chrono::Duration::hours(24))
            .await
            .unwrap();
        let ids: Vec<Uuid> = stale.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![old.id]);
    }

    #[tokio::test]
    async fn test_recover_processing() {
        let (_dir, pool) = temp_pool().await;
        let repo = SessionRepository::new(&pool);
        let s = session("fp-crash");
        repo.insert_if_absent(&s).await.unwrap();
        repo.transition(s.id, &[SessionState::Uploading], SessionState::Processing)
            .await
            .unwrap();

        assert_eq!(repo.recover_processing().await.unwrap(), 1);
        let s = repo.get(s.id).await.unwrap().unwrap();
        assert_eq!(s.state, SessionState::Uploading);
    }
}
