//! HTTP error response conversion
//!
//! Maps `GateError` onto the wire contract: the status code from the error
//! metadata, a plain-text body, and the `X-Request-ID` / `X-Error-Type`
//! headers on every error response.

use avgate_core::{ErrorMetadata, GateError, LogLevel};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

pub fn log_error(error: &GateError) {
    let error_kind = error.error_kind();
    match error.log_level() {
        LogLevel::Debug => {
            tracing::debug!(error = %error, error_kind, "Request failed");
        }
        LogLevel::Warn => {
            tracing::warn!(error = %error, error_kind, "Request failed");
        }
        LogLevel::Error => {
            tracing::error!(error = %error, error_kind, "Request failed");
        }
    }
}

/// Builds the error response for a failed request.
pub fn error_response(error: &GateError, request_id: &str) -> Response {
    log_error(error);

    let status =
        StatusCode::from_u16(error.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = (status, error.client_message()).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        "x-error-type",
        HeaderValue::from_static(error.error_kind()),
    );
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", value);
    }
    response
}
