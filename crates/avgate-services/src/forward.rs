//! Backend forwarder.
//!
//! Rebuilds the upload as a freshly framed multipart POST whose body is a
//! lazy stream over the spool buffer, so the file is never held in memory
//! a second time. The orchestrator calls [`BackendForwarder::forward`]
//! exactly once per request (the upstream treats an upload as a single-use
//! token); [`BackendForwarder::forward_with_retry`] exists for callers
//! with idempotent upstreams.

use std::time::Duration;

use avgate_core::config::LARGE_PAYLOAD_BYTES;
use avgate_core::GateConfig;
use avgate_processing::BufferReader;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::{Body, Client};

/// Request headers that are never copied to the backend; the forwarder
/// replaces them with its own framing.
const SKIPPED_REQUEST_HEADERS: &[&str] =
    &["host", "content-length", "content-type", "transfer-encoding"];

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("invalid forward parameters: {0}")]
    Parameter(String),

    #[error("backend connect failed: {0}")]
    Connect(String),

    #[error("backend request timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend request failed: {0}")]
    Upstream(String),
}

impl ForwardError {
    fn from_reqwest(err: reqwest::Error, deadline: Duration) -> Self {
        if err.is_timeout() {
            ForwardError::Timeout(deadline)
        } else if err.is_connect() {
            ForwardError::Connect(err.to_string())
        } else if err.is_builder() || err.is_request() {
            ForwardError::Parameter(err.to_string())
        } else {
            ForwardError::Upstream(err.to_string())
        }
    }
}

/// Connection-level facts about the inbound client, re-emitted as
/// X-Forwarded-* headers.
#[derive(Clone, Debug)]
pub struct ForwardedContext {
    pub client_ip: String,
    pub proto: String,
    pub host: String,
    pub port: u16,
}

/// One forward attempt's worth of input. The reader is consumed by the
/// body stream, so retrying callers build a fresh request per attempt.
pub struct ForwardRequest {
    /// Full backend URL (request URI preserved verbatim).
    pub url: String,
    /// Inbound request headers, verbatim.
    pub headers: HeaderMap,
    /// Raw headers of the file part, re-emitted in order.
    pub part_headers: Vec<(String, String)>,
    /// Cursor over the full buffered file.
    pub reader: BufferReader,
    pub total_size: u64,
    pub forwarded: ForwardedContext,
}

pub struct BackendForwarder {
    client: Client,
    socket_timeout: Duration,
}

impl BackendForwarder {
    pub fn new(config: &GateConfig) -> Result<Self, anyhow::Error> {
        use anyhow::Context;
        // Per-request timeouts are set at call time because they scale
        // with payload size
        let client = Client::builder()
            .connect_timeout(config.socket_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to create HTTP client for backend forwarding")?;
        Ok(Self {
            client,
            socket_timeout: config.socket_timeout,
        })
    }

    /// Sends the buffered upload to the backend as a chunked multipart
    /// POST and returns the backend response with headers read, body
    /// unread.
    pub async fn forward(&self, request: ForwardRequest) -> Result<reqwest::Response, ForwardError> {
        let deadline = transfer_deadline(request.total_size);
        let boundary = multipart_boundary();

        let mut headers = filtered_headers(&request.headers);
        insert_forwarded_headers(&mut headers, &request.forwarded);
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_str(&format!("multipart/form-data; boundary={}", boundary))
                .map_err(|e| ForwardError::Parameter(e.to_string()))?,
        );

        let body = multipart_body(&boundary, &request.part_headers, request.reader);

        tracing::debug!(
            url = %request.url,
            bytes = request.total_size,
            boundary = %boundary,
            "Forwarding upload to backend"
        );

        self.client
            .post(&request.url)
            .headers(headers)
            .timeout(deadline)
            .body(body)
            .send()
            .await
            .map_err(|e| ForwardError::from_reqwest(e, deadline))
    }

    /// Retry wrapper with quadratic backoff. Parameter errors never
    /// retry; connection errors stop retrying once the payload is large
    /// enough that replaying it would hurt more than failing.
    pub async fn forward_with_retry<F>(
        &self,
        max_attempts: u32,
        mut make_request: F,
    ) -> Result<reqwest::Response, ForwardError>
    where
        F: FnMut() -> ForwardRequest,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let request = make_request();
            let total_size = request.total_size;
            match self.forward(request).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt >= max_attempts => return Err(e),
                Err(ForwardError::Parameter(e)) => return Err(ForwardError::Parameter(e)),
                Err(ForwardError::Connect(e)) if total_size > LARGE_PAYLOAD_BYTES => {
                    return Err(ForwardError::Connect(e));
                }
                Err(e) => {
                    let backoff = self.socket_timeout / 10 * attempt * attempt;
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Backend forward failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

/// Scan/forward phase deadline: 60s, 300s above 100 MiB.
fn transfer_deadline(total_size: u64) -> Duration {
    if total_size > LARGE_PAYLOAD_BYTES {
        Duration::from_secs(300)
    } else {
        Duration::from_secs(60)
    }
}

/// `----WebKitFormBoundary` plus 16 random alphanumerics, the framing
/// browsers emit.
fn multipart_boundary() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("----WebKitFormBoundary{}", suffix)
}

fn filtered_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound {
        if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn insert_forwarded_headers(headers: &mut HeaderMap, forwarded: &ForwardedContext) {
    let pairs: [(&str, String); 5] = [
        ("x-forwarded-for", forwarded.client_ip.clone()),
        ("x-real-ip", forwarded.client_ip.clone()),
        ("x-forwarded-proto", forwarded.proto.clone()),
        ("x-forwarded-host", forwarded.host.clone()),
        ("x-forwarded-port", forwarded.port.to_string()),
    ];
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}

/// Three-phase lazy body: preamble, file chunks, postamble. Each item
/// becomes one HTTP chunk on the wire.
fn multipart_body(
    boundary: &str,
    part_headers: &[(String, String)],
    reader: BufferReader,
) -> Body {
    let mut preamble = format!("--{}\r\n", boundary);
    for (name, value) in part_headers {
        preamble.push_str(name);
        preamble.push_str(": ");
        preamble.push_str(value);
        preamble.push_str("\r\n");
    }
    preamble.push_str("\r\n");

    let postamble = format!("\r\n--{}--\r\n", boundary);

    let stream = stream::once(async move { std::io::Result::Ok(Bytes::from(preamble)) })
        .chain(reader.into_stream())
        .chain(stream::once(async move {
            std::io::Result::Ok(Bytes::from(postamble))
        }));

    Body::wrap_stream(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use avgate_processing::SpoolBuffer;
    use axum::extract::Request;
    use axum::routing::post;
    use axum::Router;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Captured {
        headers: Option<HeaderMap>,
        body: Vec<u8>,
    }

    async fn spawn_backend() -> (u16, Arc<Mutex<Captured>>) {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let captured_clone = captured.clone();

        let app = Router::new().route(
            "/upload/*rest",
            post(move |request: Request| {
                let captured = captured_clone.clone();
                async move {
                    let (parts, body) = request.into_parts();
                    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
                    let mut guard = captured.lock().await;
                    guard.headers = Some(parts.headers);
                    guard.body = bytes.to_vec();
                    (axum::http::StatusCode::CREATED, "{\"ok\":true}")
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (port, captured)
    }

    fn forwarder() -> BackendForwarder {
        let config = GateConfig {
            server_port: 8000,
            icap_host: "clamcap".to_string(),
            icap_port: 1344,
            icap_service: "avscan".to_string(),
            icap_preview_size: 1024,
            upload_chunk_size: 4096,
            upload_timeout: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            backend_protocol: "http".to_string(),
            backend_host: "dms".to_string(),
            backend_port: 8080,
            log_icap_traffic: false,
            check_mime_type: true,
            allowed_extensions: vec![],
            limits_exceeded_behaviour: avgate_core::LimitsExceededBehaviour::Block,
            memory_threshold: 100 * 1024 * 1024,
            max_file_size: 1024 * 1024 * 1024,
            tmp_dir: std::env::temp_dir(),
            icap_failure_threshold: 5,
            backend_failure_threshold: 3,
            icap_recovery_timeout: Duration::from_secs(60),
            backend_recovery_timeout: Duration::from_secs(30),
        };
        BackendForwarder::new(&config).unwrap()
    }

    fn forwarded_context() -> ForwardedContext {
        ForwardedContext {
            client_ip: "203.0.113.9".to_string(),
            proto: "http".to_string(),
            host: "gate.example.com".to_string(),
            port: 8000,
        }
    }

    async fn request_for(port: u16, payload: &[u8], dir: &tempfile::TempDir) -> ForwardRequest {
        let mut buffer = SpoolBuffer::new(1024 * 1024, 1024 * 1024 * 1024, dir.path());
        buffer.append(payload).await.unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok"));
        headers.insert("host", HeaderValue::from_static("gate.example.com"));
        headers.insert("content-type", HeaderValue::from_static("multipart/form-data; boundary=old"));
        headers.insert("content-length", HeaderValue::from_static("12345"));

        ForwardRequest {
            url: format!("http://127.0.0.1:{}/upload/files?q=1", port),
            headers,
            part_headers: vec![
                (
                    "Content-Disposition".to_string(),
                    "form-data; name=\"file\"; filename=\"doc.pdf\"".to_string(),
                ),
                ("Content-Type".to_string(), "application/pdf".to_string()),
            ],
            reader: buffer.reader(0),
            total_size: buffer.total_size(),
            forwarded: forwarded_context(),
        }
    }

    #[tokio::test]
    async fn forwards_fresh_multipart_envelope() {
        let (port, captured) = spawn_backend().await;
        let dir = tempfile::TempDir::new().unwrap();
        let payload = b"%PDF-1.7 file body";

        let response = forwarder()
            .forward(request_for(port, payload, &dir).await)
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        assert_eq!(response.text().await.unwrap(), "{\"ok\":true}");

        let guard = captured.lock().await;
        let headers = guard.headers.as_ref().unwrap();

        // New boundary, not the client's
        let content_type = headers.get("content-type").unwrap().to_str().unwrap();
        let boundary = content_type
            .strip_prefix("multipart/form-data; boundary=")
            .unwrap();
        assert!(boundary.starts_with("----WebKitFormBoundary"));
        assert_eq!(boundary.len(), "----WebKitFormBoundary".len() + 16);

        // Copied and injected headers
        assert_eq!(headers.get("authorization").unwrap(), "Bearer tok");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.9");
        assert_eq!(headers.get("x-real-ip").unwrap(), "203.0.113.9");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "gate.example.com");
        assert_eq!(headers.get("x-forwarded-port").unwrap(), "8000");

        // Body framing: preamble with the captured part headers, file
        // bytes, postamble
        let expected = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"doc.pdf\"\r\nContent-Type: application/pdf\r\n\r\n%PDF-1.7 file body\r\n--{b}--\r\n",
            b = boundary
        );
        assert_eq!(String::from_utf8_lossy(&guard.body), expected);
    }

    #[tokio::test]
    async fn connect_failure_maps_to_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::TempDir::new().unwrap();
        let err = forwarder()
            .forward(request_for(port, b"data", &dir).await)
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Connect(_)));
    }

    #[tokio::test]
    async fn retry_wrapper_eventually_succeeds() {
        let (port, _captured) = spawn_backend().await;
        let dir = tempfile::TempDir::new().unwrap();

        // First attempt goes to a dead port, second to the live backend
        let dead = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let p = l.local_addr().unwrap().port();
            drop(l);
            p
        };

        let forwarder = forwarder();
        let mut buffer = SpoolBuffer::new(1024 * 1024, 1024 * 1024, dir.path());
        buffer.append(b"retry payload").await.unwrap();
        let total_size = buffer.total_size();

        // Memory-mode readers are snapshots, so both attempts can be
        // prepared up front
        let mut attempts = vec![
            Some((format!("http://127.0.0.1:{}/upload/x", dead), buffer.reader(0))),
            Some((format!("http://127.0.0.1:{}/upload/x", port), buffer.reader(0))),
        ];
        let mut next = 0usize;
        let make = move || {
            let (url, reader) = attempts[next].take().unwrap();
            next += 1;
            ForwardRequest {
                url,
                headers: HeaderMap::new(),
                part_headers: vec![(
                    "Content-Disposition".to_string(),
                    "form-data; name=\"file\"; filename=\"r.bin\"".to_string(),
                )],
                reader,
                total_size,
                forwarded: forwarded_context(),
            }
        };

        let response = forwarder.forward_with_retry(3, make).await.unwrap();
        assert_eq!(response.status(), 201);
    }
}
