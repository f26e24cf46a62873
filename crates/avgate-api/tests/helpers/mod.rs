//! Test helpers: gate state, protocol stubs, and multipart builders.
//!
//! Run from workspace root: `cargo test -p avgate-api`.
#![allow(dead_code)] // each test binary uses a different subset

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use avgate_api::setup::routes::setup_routes;
use avgate_api::AppState;
use avgate_core::{GateConfig, LimitsExceededBehaviour};
use axum::body::Bytes;
use axum_test::multipart::{MultipartForm, Part};
use axum_test::TestServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Gate configuration pointed at the given stub ports, with a dedicated
/// spool directory per test.
pub fn test_config(icap_port: u16, backend_port: u16, tmp_dir: &Path) -> GateConfig {
    GateConfig {
        server_port: 8000,
        icap_host: "127.0.0.1".to_string(),
        icap_port,
        icap_service: "avscan".to_string(),
        icap_preview_size: 1024,
        upload_chunk_size: 4096,
        upload_timeout: Duration::from_secs(5),
        socket_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(60),
        backend_protocol: "http".to_string(),
        backend_host: "127.0.0.1".to_string(),
        backend_port,
        log_icap_traffic: false,
        check_mime_type: true,
        allowed_extensions: vec![],
        limits_exceeded_behaviour: LimitsExceededBehaviour::Block,
        memory_threshold: 100 * 1024 * 1024,
        max_file_size: 1024 * 1024 * 1024,
        tmp_dir: tmp_dir.to_path_buf(),
        icap_failure_threshold: 5,
        backend_failure_threshold: 3,
        icap_recovery_timeout: Duration::from_secs(60),
        backend_recovery_timeout: Duration::from_secs(30),
    }
}

pub fn test_server(config: GateConfig) -> TestServer {
    let state = Arc::new(AppState::new(config).expect("state"));
    TestServer::new(setup_routes(state)).expect("test server")
}

pub fn file_form(filename: &str, content_type: &str, bytes: Vec<u8>) -> MultipartForm {
    let part = Part::bytes(Bytes::from(bytes))
        .file_name(filename)
        .mime_type(content_type);
    MultipartForm::new().add_part("file", part)
}

/// A 2048-byte PNG-signed payload.
pub fn png_payload() -> Vec<u8> {
    let mut data = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    data.extend((8..2048u32).map(|i| (i.wrapping_mul(31) % 251) as u8));
    data
}

/// True when the spool directory holds no files.
pub fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

// ---- ICAP stub ----

/// How the stub scanner answers each exchange.
#[derive(Clone)]
pub enum IcapMode {
    /// `204 No Content` straight after the preview.
    CleanPreview,
    /// `100 Continue`, then `204` once the remainder and terminator arrive.
    CleanAfterContinue,
    /// A fixed raw response after the preview.
    Blocked(&'static [u8]),
}

#[derive(Default)]
pub struct IcapReport {
    pub connections: usize,
    pub body_bytes: u64,
    pub saw_ieof: bool,
}

pub struct IcapStub {
    pub port: u16,
    pub report: Arc<Mutex<IcapReport>>,
}

pub async fn spawn_icap_stub(mode: IcapMode) -> IcapStub {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("icap stub");
    spawn_icap_stub_on(listener, mode)
}

/// Variant taking a pre-bound listener, for tests that need to bring the
/// scanner up on a known port after it has been down.
pub fn spawn_icap_stub_on(listener: TcpListener, mode: IcapMode) -> IcapStub {
    let port = listener.local_addr().expect("stub addr").port();
    let report = Arc::new(Mutex::new(IcapReport::default()));
    let report_clone = report.clone();

    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                break;
            };
            let mode = mode.clone();
            let report = report_clone.clone();
            tokio::spawn(async move {
                let _ = handle_icap_connection(sock, mode, report).await;
            });
        }
    });

    IcapStub { port, report }
}

async fn handle_icap_connection(
    mut sock: TcpStream,
    mode: IcapMode,
    report: Arc<Mutex<IcapReport>>,
) -> std::io::Result<()> {
    read_until(&mut sock, b"\r\n0\r\n\r\n").await?;
    report.lock().await.connections += 1;

    match mode {
        IcapMode::CleanPreview => {
            sock.write_all(b"ICAP/1.0 204 No Content\r\n\r\n").await?;
        }
        IcapMode::Blocked(response) => {
            sock.write_all(response).await?;
        }
        IcapMode::CleanAfterContinue => {
            sock.write_all(b"ICAP/1.0 100 Continue\r\n\r\n").await?;

            let line = read_line(&mut sock).await?;
            if line.starts_with("0; ieof") {
                let mut guard = report.lock().await;
                guard.saw_ieof = true;
                guard.body_bytes = 0;
            } else {
                let size = u64::from_str_radix(line.trim(), 16).unwrap_or(0);
                let mut remaining = size;
                let mut buf = vec![0u8; 64 * 1024];
                while remaining > 0 {
                    let want = buf.len().min(remaining as usize);
                    let n = sock.read(&mut buf[..want]).await?;
                    if n == 0 {
                        break;
                    }
                    remaining -= n as u64;
                }
                let tail = read_until(&mut sock, b"0; ieof\r\n\r\n").await?;
                let mut guard = report.lock().await;
                guard.body_bytes = size - remaining;
                guard.saw_ieof = tail.ends_with(b"0; ieof\r\n\r\n");
            }
            sock.write_all(b"\r\nICAP/1.0 204 No Content\r\n\r\n").await?;
        }
    }
    Ok(())
}

async fn read_until(sock: &mut TcpStream, marker: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut seen = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        if seen.windows(marker.len()).any(|w| w == marker) {
            return Ok(seen);
        }
        let n = sock.read(&mut buf).await?;
        if n == 0 {
            return Ok(seen);
        }
        seen.extend_from_slice(&buf[..n]);
    }
}

async fn read_line(sock: &mut TcpStream) -> std::io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = sock.read(&mut byte).await?;
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            line.push(byte[0]);
        }
    }
    Ok(String::from_utf8_lossy(&line).to_string())
}

// ---- Backend stub ----

pub struct CapturedRequest {
    pub uri: String,
    pub headers: axum::http::HeaderMap,
    pub body: Vec<u8>,
}

pub struct BackendStub {
    pub port: u16,
    pub captured: Arc<Mutex<Vec<CapturedRequest>>>,
}

/// Minimal backend: captures every request and answers with a fixed
/// status and body.
pub async fn spawn_backend_stub(status: u16, body: &'static str) -> BackendStub {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let captured_clone = captured.clone();

    let app = axum::Router::new().fallback(move |request: axum::extract::Request| {
        let captured = captured_clone.clone();
        async move {
            let uri = request.uri().to_string();
            let (parts, req_body) = request.into_parts();
            let bytes = axum::body::to_bytes(req_body, usize::MAX)
                .await
                .unwrap_or_default();
            captured.lock().await.push(CapturedRequest {
                uri,
                headers: parts.headers,
                body: bytes.to_vec(),
            });
            (
                axum::http::StatusCode::from_u16(status).unwrap(),
                [("x-backend", "stub")],
                body,
            )
        }
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("backend stub");
    let port = listener.local_addr().expect("backend addr").port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    BackendStub { port, captured }
}

/// A TCP port with nothing listening on it.
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("probe");
    let port = listener.local_addr().expect("probe addr").port();
    drop(listener);
    port
}
