//! Configuration module
//!
//! Process-wide configuration for the upload gate, read once from the
//! environment at startup and immutable afterwards. Values cover the HTTP
//! ingress, the ICAP scanner, the backend upstream, the spool buffer, and
//! the circuit breakers.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

// Common constants
const SERVER_PORT: u16 = 8000;
const ICAP_PORT: u16 = 1344;
const ICAP_PREVIEW_SIZE: usize = 1024;
const UPLOAD_CHUNK_SIZE: usize = 4096;
const UPLOAD_TIMEOUT_MS: u64 = 5000;
const SOCKET_TIMEOUT_MS: u64 = 5000;
const BACKEND_PORT: u16 = 8080;
const REQUEST_TIMEOUT_MS: u64 = 60_000;
const MEMORY_THRESHOLD: u64 = 100 * 1024 * 1024;
const MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;
const ICAP_FAILURE_THRESHOLD: u32 = 5;
const BACKEND_FAILURE_THRESHOLD: u32 = 3;
const ICAP_RECOVERY_TIMEOUT_MS: u64 = 60_000;
const BACKEND_RECOVERY_TIMEOUT_MS: u64 = 30_000;

/// Payloads above this size get the extended (5x) timeouts.
pub const LARGE_PAYLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// What to do when the scanner reports its own file-size limit was exceeded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitsExceededBehaviour {
    /// Treat the verdict as a block (403).
    Block,
    /// Let the upload through to the backend unscanned past the limit.
    Allow,
}

/// Application configuration (upload gate).
#[derive(Clone, Debug)]
pub struct GateConfig {
    pub server_port: u16,
    // ICAP scanner
    pub icap_host: String,
    pub icap_port: u16,
    pub icap_service: String,
    pub icap_preview_size: usize,
    // Client-side upload handling
    pub upload_chunk_size: usize,
    pub upload_timeout: Duration,
    pub socket_timeout: Duration,
    pub request_timeout: Duration,
    // Backend upstream
    pub backend_protocol: String,
    pub backend_host: String,
    pub backend_port: u16,
    // Behaviour switches
    pub log_icap_traffic: bool,
    pub check_mime_type: bool,
    pub allowed_extensions: Vec<String>,
    pub limits_exceeded_behaviour: LimitsExceededBehaviour,
    // Spool buffer
    pub memory_threshold: u64,
    pub max_file_size: u64,
    pub tmp_dir: PathBuf,
    // Circuit breakers
    pub icap_failure_threshold: u32,
    pub backend_failure_threshold: u32,
    pub icap_recovery_timeout: Duration,
    pub backend_recovery_timeout: Duration,
}

impl GateConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let allowed_extensions = env::var("ALLOWED_EXTENSIONS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().trim_start_matches('.').to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let limits_exceeded_behaviour = match env::var("LIMITS_EXCEEDED_BEHAVIOUR")
            .unwrap_or_else(|_| "block".to_string())
            .to_lowercase()
            .as_str()
        {
            "allow" => LimitsExceededBehaviour::Allow,
            _ => LimitsExceededBehaviour::Block,
        };

        let config = GateConfig {
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| SERVER_PORT.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SERVER_PORT must be a valid port number"))?,
            icap_host: env::var("ICAP_SERVER_HOST").unwrap_or_else(|_| "clamcap".to_string()),
            icap_port: env::var("ICAP_SERVER_PORT")
                .unwrap_or_else(|_| ICAP_PORT.to_string())
                .parse()
                .unwrap_or(ICAP_PORT),
            icap_service: env::var("ICAP_SERVICE_NAME").unwrap_or_else(|_| "avscan".to_string()),
            icap_preview_size: env::var("ICAP_PREVIEW_SIZE")
                .unwrap_or_else(|_| ICAP_PREVIEW_SIZE.to_string())
                .parse()
                .unwrap_or(ICAP_PREVIEW_SIZE),
            upload_chunk_size: env::var("UPLOAD_CHUNK_SIZE")
                .unwrap_or_else(|_| UPLOAD_CHUNK_SIZE.to_string())
                .parse()
                .unwrap_or(UPLOAD_CHUNK_SIZE),
            upload_timeout: millis_var("UPLOAD_TIMEOUT", UPLOAD_TIMEOUT_MS),
            socket_timeout: millis_var("SOCKET_TIMEOUT", SOCKET_TIMEOUT_MS),
            request_timeout: millis_var("REQUEST_TIMEOUT", REQUEST_TIMEOUT_MS),
            backend_protocol: env::var("BACKEND_PROTOCOL")
                .unwrap_or_else(|_| "http".to_string())
                .to_lowercase(),
            backend_host: env::var("BACKEND_HOST").unwrap_or_else(|_| "dms".to_string()),
            backend_port: env::var("BACKEND_PORT")
                .unwrap_or_else(|_| BACKEND_PORT.to_string())
                .parse()
                .unwrap_or(BACKEND_PORT),
            log_icap_traffic: env::var("LOG_ICAP_TRAFFIC")
                .unwrap_or_else(|_| "false".to_string())
                .to_lowercase()
                .parse()
                .unwrap_or(false),
            check_mime_type: env::var("CHECK_MIME_TYPE")
                .unwrap_or_else(|_| "true".to_string())
                .to_lowercase()
                .parse()
                .unwrap_or(true),
            allowed_extensions,
            limits_exceeded_behaviour,
            memory_threshold: env::var("MEMORY_THRESHOLD")
                .unwrap_or_else(|_| MEMORY_THRESHOLD.to_string())
                .parse()
                .unwrap_or(MEMORY_THRESHOLD),
            max_file_size: env::var("MAX_FILE_SIZE")
                .unwrap_or_else(|_| MAX_FILE_SIZE.to_string())
                .parse()
                .unwrap_or(MAX_FILE_SIZE),
            tmp_dir: env::var("UPLOAD_TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir()),
            icap_failure_threshold: env::var("ICAP_FAILURE_THRESHOLD")
                .unwrap_or_else(|_| ICAP_FAILURE_THRESHOLD.to_string())
                .parse()
                .unwrap_or(ICAP_FAILURE_THRESHOLD),
            backend_failure_threshold: env::var("BACKEND_FAILURE_THRESHOLD")
                .unwrap_or_else(|_| BACKEND_FAILURE_THRESHOLD.to_string())
                .parse()
                .unwrap_or(BACKEND_FAILURE_THRESHOLD),
            icap_recovery_timeout: millis_var("ICAP_RECOVERY_TIMEOUT", ICAP_RECOVERY_TIMEOUT_MS),
            backend_recovery_timeout: millis_var(
                "BACKEND_RECOVERY_TIMEOUT",
                BACKEND_RECOVERY_TIMEOUT_MS,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !matches!(self.backend_protocol.as_str(), "http" | "https") {
            return Err(anyhow::anyhow!(
                "BACKEND_PROTOCOL must be 'http' or 'https'"
            ));
        }

        if self.memory_threshold > self.max_file_size {
            return Err(anyhow::anyhow!(
                "MEMORY_THRESHOLD cannot exceed MAX_FILE_SIZE"
            ));
        }

        if self.icap_preview_size == 0 {
            return Err(anyhow::anyhow!("ICAP_PREVIEW_SIZE must be non-zero"));
        }

        Ok(())
    }

    /// True when the configured extension allow-list admits `extension`.
    /// An empty list admits everything.
    pub fn is_extension_allowed(&self, extension: &str) -> bool {
        self.allowed_extensions.is_empty()
            || self
                .allowed_extensions
                .iter()
                .any(|e| e == &extension.to_lowercase())
    }

    /// Socket deadline for a payload of `total_size` bytes. Large payloads
    /// get five times the base deadline.
    pub fn socket_timeout_for(&self, total_size: u64) -> Duration {
        scale_for_payload(self.socket_timeout, total_size)
    }

    /// Phase deadline for the scan and forward phases (60s base, 300s for
    /// large payloads).
    pub fn transfer_timeout_for(&self, total_size: u64) -> Duration {
        scale_for_payload(Duration::from_secs(60), total_size)
    }

    /// Global per-request deadline, widened in step with the size-aware
    /// phase deadlines.
    pub fn request_timeout_for(&self, total_size: u64) -> Duration {
        let widened = scale_for_payload(self.request_timeout, total_size);
        self.request_timeout.max(widened)
    }

    /// Authority portion of the backend URL; the default port for the
    /// protocol is omitted.
    pub fn backend_authority(&self) -> String {
        let default_port = match self.backend_protocol.as_str() {
            "https" => 443,
            _ => 80,
        };
        if self.backend_port == default_port {
            self.backend_host.clone()
        } else {
            format!("{}:{}", self.backend_host, self.backend_port)
        }
    }

    /// Full backend URL for a given request URI (preserved verbatim).
    pub fn backend_url(&self, request_uri: &str) -> String {
        format!(
            "{}://{}{}",
            self.backend_protocol,
            self.backend_authority(),
            request_uri
        )
    }
}

fn millis_var(key: &str, default_ms: u64) -> Duration {
    let ms = env::var(key)
        .unwrap_or_else(|_| default_ms.to_string())
        .parse()
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

fn scale_for_payload(base: Duration, total_size: u64) -> Duration {
    if total_size > LARGE_PAYLOAD_BYTES {
        base * 5
    } else {
        base
    }
}
