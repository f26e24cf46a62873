//! Circuit breaker behaviour under sustained scanner and backend outages.

mod helpers;

use std::time::Duration;

use helpers::{
    dead_port, file_form, spawn_backend_stub, spawn_icap_stub, spawn_icap_stub_on, test_config,
    test_server, IcapMode,
};
use tempfile::TempDir;

#[tokio::test]
async fn icap_outage_trips_the_breaker_and_recovers() {
    let tmp = TempDir::new().unwrap();
    let icap_port = dead_port().await;
    let backend = spawn_backend_stub(200, "ok").await;

    let mut config = test_config(icap_port, backend.port, tmp.path());
    config.icap_failure_threshold = 5;
    config.icap_recovery_timeout = Duration::from_millis(200);
    let server = test_server(config);

    // Five consecutive connect failures
    for _ in 0..5 {
        let response = server
            .post("/upload")
            .multipart(file_form(
                "f.bin",
                "application/octet-stream",
                vec![1u8; 64],
            ))
            .await;
        assert_eq!(response.status_code(), 502);
        assert_eq!(response.header("x-error-type"), "ICAP_CONNECTION_ERROR");
    }

    // The sixth fails fast without attempting a connect
    let response = server
        .post("/upload")
        .multipart(file_form(
            "f.bin",
            "application/octet-stream",
            vec![1u8; 64],
        ))
        .await;
    assert_eq!(response.status_code(), 503);
    assert_eq!(response.header("x-error-type"), "SERVICE_UNAVAILABLE");
    assert!(backend.captured.lock().await.is_empty());

    // Scanner comes back on the same port; after the recovery window the
    // half-open probe succeeds
    tokio::time::sleep(Duration::from_millis(250)).await;
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", icap_port))
        .await
        .expect("rebind scanner port");
    let icap = spawn_icap_stub_on(listener, IcapMode::CleanPreview);

    let response = server
        .post("/upload")
        .multipart(file_form(
            "f.bin",
            "application/octet-stream",
            vec![1u8; 64],
        ))
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(icap.report.lock().await.connections, 1);
    assert_eq!(backend.captured.lock().await.len(), 1);
}

#[tokio::test]
async fn backend_outage_trips_its_own_breaker() {
    let tmp = TempDir::new().unwrap();
    let icap = spawn_icap_stub(IcapMode::CleanPreview).await;
    let backend_port = dead_port().await;

    let mut config = test_config(icap.port, backend_port, tmp.path());
    config.backend_failure_threshold = 3;
    let server = test_server(config);

    for _ in 0..3 {
        let response = server
            .post("/upload")
            .multipart(file_form(
                "f.bin",
                "application/octet-stream",
                vec![2u8; 64],
            ))
            .await;
        assert_eq!(response.status_code(), 502);
        assert_eq!(response.header("x-error-type"), "BACKEND_ERROR");
    }

    let response = server
        .post("/upload")
        .multipart(file_form(
            "f.bin",
            "application/octet-stream",
            vec![2u8; 64],
        ))
        .await;
    assert_eq!(response.status_code(), 503);
    assert_eq!(response.header("x-error-type"), "SERVICE_UNAVAILABLE");

    // The scanner breaker is untouched: every request, including the one
    // that failed fast at the backend, still got scanned
    assert_eq!(icap.report.lock().await.connections, 4);
}
