//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL)
        .execute(pool)
        .await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Upload sessions, one per fingerprint
CREATE TABLE IF NOT EXISTS upload_sessions (
    id TEXT PRIMARY KEY,
    original_name TEXT NOT NULL,
    fingerprint TEXT NOT NULL UNIQUE,
    total_size INTEGER NOT NULL,
    chunk_count INTEGER NOT NULL,
    chunk_size INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'UPLOADING',
    final_digest TEXT,
    manifest TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_upload_sessions_state ON upload_sessions(state);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_created ON upload_sessions(created_at);

-- Admitted chunks; absence of a row means "not yet received"
CREATE TABLE IF NOT EXISTS upload_chunks (
    session_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'RECEIVED',
    received_at TEXT NOT NULL,

    PRIMARY KEY (session_id, chunk_index)
);
"#;
