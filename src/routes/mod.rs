//! Route modules for the ChunkVault server

pub mod chaos;
pub mod health;
pub mod upload;

use axum::{middleware, routing::get, Router};

use crate::state::AppState;
use crate::upload::API_BASE;

/// Build the application router
pub fn router(state: AppState) -> Router {
    let upload_state = upload::UploadState {
        session_manager: state.sessions().clone(),
    };

    let mut uploads = upload::router(upload_state);
    if state.faults().is_enabled() {
        tracing::warn!("Chaos mode enabled, injecting faults into upload requests");
        uploads = uploads.layer(middleware::from_fn_with_state(
            state.faults(),
            chaos::inject_faults,
        ));
    }

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/health", get(health::health_check))
        .nest(API_BASE, uploads)
        .with_state(state)
}
