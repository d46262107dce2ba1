//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::fault::FaultInjector;
use crate::upload::SessionManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    sessions: SessionManager,
    faults: Arc<FaultInjector>,
}

impl AppState {
    /// Create a new application state
    pub fn new(config: Config, db: SqlitePool, sessions: SessionManager) -> Self {
        let faults = Arc::new(FaultInjector::new(config.chaos.clone()));

        Self {
            inner: Arc::new(AppStateInner {
                config,
                db,
                sessions,
                faults,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Get the session manager
    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// Get the fault injector (inert unless chaos is enabled)
    pub fn faults(&self) -> Arc<FaultInjector> {
        self.inner.faults.clone()
    }
}
