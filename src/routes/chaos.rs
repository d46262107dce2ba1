//! Chaos middleware
//!
//! Delays requests and fails a fraction of chunk uploads according to the
//! configured [`FaultInjector`]. Only installed when chaos is enabled.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::fault::FaultInjector;
use crate::upload::UploadError;

fn is_chunk_upload(request: &Request) -> bool {
    request.method() == Method::POST && request.uri().path().contains("/chunks/")
}

/// Apply one fault decision to the request
pub async fn inject_faults(
    State(injector): State<Arc<FaultInjector>>,
    request: Request,
    next: Next,
) -> Response {
    let decision = injector.decide(is_chunk_upload(&request));

    if !decision.delay.is_zero() {
        tokio::time::sleep(decision.delay).await;
    }

    if decision.fail {
        tracing::warn!(path = %request.uri().path(), "Chaos: injected chunk failure");
        return UploadError::Internal("Injected fault".to_string()).into_response();
    }

    next.run(request).await
}
