//! The upload gate handler.
//!
//! Accepts any-path multipart POSTs, drives the pipeline, and either
//! relays the backend response or renders the error contract. Cleanup
//! always runs before the response leaves this function.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Multipart, State};
use axum::http::{header, HeaderMap, HeaderValue, Uri};
use axum::response::Response;
use avgate_core::ErrorMetadata;
use avgate_services::ForwardedContext;
use uuid::Uuid;

use crate::error::error_response;
use crate::services::context::RequestContext;
use crate::services::pipeline;
use crate::state::AppState;
use crate::utils::{extract_client_ip, strip_hop_by_hop};

pub async fn gate_upload(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    uri: Uri,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let socket_addr = connect_info.as_ref().map(|ci| &ci.0);
    let forwarded = ForwardedContext {
        client_ip: extract_client_ip(&headers, socket_addr),
        proto: "http".to_string(),
        host: headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        port: state.config.server_port,
    };

    let mut ctx = RequestContext::new(request_id.clone());
    let result = pipeline::run(&state, &mut ctx, &uri, &headers, forwarded, multipart).await;
    ctx.run_cleanup().await;

    let duration_ms = ctx.elapsed().as_millis() as u64;
    let open_resources = ctx
        .tracker
        .lock()
        .map(|t| t.open_count())
        .unwrap_or_default();
    match result {
        Ok(backend_response) => {
            tracing::info!(
                request_id = %ctx.request_id,
                phase = ctx.phase,
                status = backend_response.status().as_u16(),
                duration_ms,
                bytes = ctx.bytes_processed,
                operations = ctx.operations,
                peak_memory = ctx.peak_memory(),
                open_resources,
                "Upload forwarded"
            );
            relay_response(backend_response, &request_id)
        }
        Err(e) => {
            tracing::info!(
                request_id = %ctx.request_id,
                phase = ctx.phase,
                error_kind = e.error_kind(),
                duration_ms,
                bytes = ctx.bytes_processed,
                operations = ctx.operations,
                peak_memory = ctx.peak_memory(),
                open_resources,
                "Upload rejected"
            );
            error_response(&e, &request_id)
        }
    }
}

/// Copies the backend status, headers (minus hop-by-hop), and body stream
/// to the client unchanged.
fn relay_response(backend: reqwest::Response, request_id: &str) -> Response {
    let status = backend.status();
    let headers = strip_hop_by_hop(backend.headers());

    let mut response = Response::new(Body::from_stream(backend.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
