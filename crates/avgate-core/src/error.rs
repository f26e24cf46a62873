//! Error types module
//!
//! This module provides the core error taxonomy used throughout the gate.
//! All failures are unified under the `GateError` enum; each variant maps
//! to a fixed HTTP status, a machine-readable kind reported in the
//! `X-Error-Type` response header, and a log level.

use std::io;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like validation failures
    Debug,
    /// Warning level - for recoverable issues like blocked uploads
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Metadata for error responses - defines how an error is presented.
pub trait ErrorMetadata {
    /// HTTP status code to return
    fn http_status_code(&self) -> u16;

    /// Machine-readable error kind (e.g., "ICAP_SCAN_ERROR")
    fn error_kind(&self) -> &'static str;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;

    /// Client-facing message (may differ from internal error message)
    fn client_message(&self) -> String;
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("MIME check failed: {0}")]
    Mime(String),

    #[error("File extension not allowed: {0}")]
    Extension(String),

    #[error("File too large: {0}")]
    Memory(String),

    #[error("ICAP connection failed: {0}")]
    IcapConnection(String),

    #[error("Upload blocked by scanner: {0}")]
    IcapScan(String),

    #[error("Backend request failed: {0}")]
    Backend(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Service unavailable: {0}")]
    CircuitOpen(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Static metadata per variant: (http_status, kind, log_level).
fn gate_error_static_metadata(err: &GateError) -> (u16, &'static str, LogLevel) {
    match err {
        GateError::Upload(_) => (400, "UPLOAD_ERROR", LogLevel::Debug),
        GateError::Validation(_) => (400, "VALIDATION_ERROR", LogLevel::Debug),
        GateError::Mime(_) => (400, "MIME_ERROR", LogLevel::Debug),
        GateError::Extension(_) => (400, "EXTENSION_ERROR", LogLevel::Debug),
        GateError::Memory(_) => (413, "MEMORY_ERROR", LogLevel::Warn),
        GateError::IcapConnection(_) => (502, "ICAP_CONNECTION_ERROR", LogLevel::Error),
        GateError::IcapScan(_) => (403, "ICAP_SCAN_ERROR", LogLevel::Warn),
        GateError::Backend(_) => (502, "BACKEND_ERROR", LogLevel::Error),
        GateError::Timeout(_) => (408, "TIMEOUT_ERROR", LogLevel::Warn),
        GateError::CircuitOpen(_) => (503, "SERVICE_UNAVAILABLE", LogLevel::Warn),
        GateError::Internal(_) => (500, "INTERNAL_ERROR", LogLevel::Error),
    }
}

impl ErrorMetadata for GateError {
    fn http_status_code(&self) -> u16 {
        gate_error_static_metadata(self).0
    }

    fn error_kind(&self) -> &'static str {
        gate_error_static_metadata(self).1
    }

    fn log_level(&self) -> LogLevel {
        gate_error_static_metadata(self).2
    }

    fn client_message(&self) -> String {
        match self {
            // Internal details stay out of client responses
            GateError::Internal(_) => "Internal server error".to_string(),
            GateError::IcapConnection(_) => "Virus scanning unavailable".to_string(),
            GateError::Backend(_) => "Upstream service unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<io::Error> for GateError {
    fn from(err: io::Error) -> Self {
        GateError::Internal(format!("IO error: {}", err))
    }
}

impl From<anyhow::Error> for GateError {
    fn from(err: anyhow::Error) -> Self {
        GateError::Internal(err.to_string())
    }
}
