//! ChunkVault Server
//!
//! Accepts resumable chunked uploads of very large files, verifies them on
//! finalize and serves the completed files for download.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chunkvault::config::Config;
use chunkvault::db;
use chunkvault::routes;
use chunkvault::state::AppState;
use chunkvault::storage::LocalBlobStore;
use chunkvault::upload::{ExpirationSweeper, SessionManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "chunkvault=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting ChunkVault Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Vault directory: {}", config.storage.vault_dir.display());
    tracing::info!("Chunk size: {} bytes", config.upload.chunk_size);

    // Initialize blob storage
    let store = LocalBlobStore::new(&config.storage.vault_dir);
    store
        .ensure_layout()
        .await
        .context("Failed to prepare vault directory")?;

    // Initialize database
    let db_pool = db::create_pool(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    let sessions = SessionManager::new(db_pool.clone(), Arc::new(store), config.upload.chunk_size);

    // Sessions left mid-verification by a crash go back to UPLOADING
    sessions
        .recover_interrupted()
        .await
        .context("Failed to recover interrupted sessions")?;

    let sweeper = ExpirationSweeper::new(
        sessions.clone(),
        config.upload.sweep_interval(),
        config.upload.max_age(),
    );
    let sweeper_handle = sweeper.start();

    // Create application state
    let app_state = AppState::new(config.clone(), db_pool, sessions);

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router
    let app = routes::router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.server.host, config.server.port))?;
    tracing::info!("ChunkVault Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper_handle.abort();
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
