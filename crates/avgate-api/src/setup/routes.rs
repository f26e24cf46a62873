//! Route configuration and setup.
//!
//! The gate is a transparent proxy: every path accepts a multipart POST
//! and is forwarded verbatim on approval. `/health` is the one local
//! endpoint.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Envelope slack on top of the file-size cap: multipart boundaries and
/// part headers.
const BODY_LIMIT_SLACK: usize = 10 * 1024 * 1024;

/// Setup all application routes
pub fn setup_routes(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_file_size as usize + BODY_LIMIT_SLACK;

    let http_concurrency_limit = std::env::var("HTTP_CONCURRENCY_LIMIT")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(10_000)
        .max(1);

    Router::new()
        .route("/health", get(health))
        .route("/", post(handlers::gate::gate_upload))
        .route("/*path", post(handlers::gate::gate_upload))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(ConcurrencyLimitLayer::new(http_concurrency_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "avgate",
        version: env!("CARGO_PKG_VERSION"),
    })
}
