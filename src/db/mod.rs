//! Database module for SQLite persistence
//!
//! Durable registry of upload sessions and admitted chunks. Every state
//! change the protocol relies on is a single conditional statement, so
//! concurrent requests never need an application-level lock.

mod chunks;
mod schema;
mod sessions;

pub use chunks::*;
pub use schema::*;
pub use sessions::*;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::error::{AppError, Result};

/// Create a new database connection pool
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run migrations
    initialize_schema(&pool).await?;

    Ok(pool)
}

/// Timestamps are stored as fixed-width RFC 3339 so they sort as text
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Internal(format!("Bad timestamp {:?}: {}", raw, e)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// File-backed pool in a temp dir; the dir must outlive the pool
    pub async fn temp_pool() -> (TempDir, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("registry.db").display());
        let pool = create_pool(&url).await.unwrap();
        (dir, pool)
    }
}
