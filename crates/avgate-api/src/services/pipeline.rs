//! The request pipeline: upload -> validate -> scan -> forward.
//!
//! A linear phase machine. Every phase names itself on the context, runs
//! under its own deadline, and the global per-request budget is re-checked
//! between phases. The scan must come back clean before a single byte
//! goes to the backend.

use std::sync::Arc;

use avgate_core::{GateConfig, GateError, LimitsExceededBehaviour};
use avgate_processing::mime::MAGIC_WINDOW;
use avgate_processing::{
    sanitize_filename, sniff, validate_declared_type, validate_extension, SpoolBuffer,
};
use avgate_services::{ForwardError, ForwardRequest, ForwardedContext, IcapError, IcapVerdict};
use axum::extract::Multipart;
use axum::http::{HeaderMap, Uri};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::context::{RequestContext, ResourceKind};
use crate::state::AppState;

/// Captured facts about the file part.
struct UploadedPart {
    part_headers: Vec<(String, String)>,
    filename: String,
    declared_type: String,
}

/// Drives one upload through the phase machine and returns the backend
/// response ready to relay. Cleanup tasks registered on `ctx` run in the
/// caller on every outcome.
pub async fn run(
    state: &AppState,
    ctx: &mut RequestContext,
    uri: &Uri,
    headers: &HeaderMap,
    forwarded: ForwardedContext,
    multipart: Multipart,
) -> Result<reqwest::Response, GateError> {
    let config = state.config.clone();

    let buffer = Arc::new(Mutex::new(SpoolBuffer::new(
        config.memory_threshold,
        config.max_file_size,
        &config.tmp_dir,
    )));
    let buffer_id = ctx
        .tracker
        .lock()
        .expect("tracker lock")
        .register(ResourceKind::Buffer, "spool buffer", 0);

    {
        let buffer = buffer.clone();
        let tracker = ctx.tracker.clone();
        ctx.add_cleanup(95, "clear_buffer", move || async move {
            buffer.lock().await.clear().await;
            if let Ok(mut tracker) = tracker.lock() {
                tracker.release(buffer_id);
            }
            Ok(())
        });
    }
    {
        let tracker = ctx.tracker.clone();
        ctx.add_cleanup(100, "drop_tracker_entries", move || async move {
            if let Ok(mut tracker) = tracker.lock() {
                tracker.drop_entries();
            }
            Ok(())
        });
    }

    // Phases: upload_init + upload_stream
    let part = receive_upload(ctx, &config, &buffer, buffer_id, multipart).await?;

    // Phase: upload_validate
    ctx.enter_phase("upload_validate");
    let total_size = buffer.lock().await.total_size();
    if total_size == 0 {
        return Err(GateError::Validation("Uploaded file is empty".to_string()));
    }
    validate_extension(&part.filename, &config.allowed_extensions)
        .map_err(|e| GateError::Extension(e.to_string()))?;

    let budget = config.request_timeout_for(total_size);

    // Phase: mime_validate
    if config.check_mime_type {
        if ctx.deadline_exceeded(budget) {
            return Err(GateError::Timeout("request budget exhausted".to_string()));
        }
        ctx.enter_phase("mime_validate");
        check_mime(ctx, &buffer, &part).await?;
    }

    // Phase: icap_scan
    if ctx.deadline_exceeded(budget) {
        return Err(GateError::Timeout("request budget exhausted".to_string()));
    }
    ctx.enter_phase("icap_scan");
    scan_with_icap(state, ctx, &config, &buffer, total_size).await?;

    // Phase: backend_forward
    if ctx.deadline_exceeded(budget) {
        return Err(GateError::Timeout("request budget exhausted".to_string()));
    }
    ctx.enter_phase("backend_forward");
    let response = forward_to_backend(
        state, ctx, &config, &buffer, total_size, uri, headers, part, forwarded,
    )
    .await?;

    ctx.enter_phase("response");
    Ok(response)
}

/// Finds the file part and streams it into the buffer. Non-file form
/// fields ahead of it are drained and ignored; exactly one file part is
/// expected per request.
async fn receive_upload(
    ctx: &mut RequestContext,
    config: &GateConfig,
    buffer: &Arc<Mutex<SpoolBuffer>>,
    buffer_id: usize,
    mut multipart: Multipart,
) -> Result<UploadedPart, GateError> {
    ctx.enter_phase("upload_init");
    let mut spool_registered = false;

    loop {
        let field = timeout(config.upload_timeout, multipart.next_field())
            .await
            .map_err(|_| GateError::Timeout("multipart part did not arrive in time".to_string()))?
            .map_err(|e| GateError::Upload(format!("Failed to read multipart: {}", e)))?;

        let Some(mut field) = field else {
            return Err(GateError::Upload("No file part in request".to_string()));
        };
        if field.file_name().is_none() {
            continue;
        }

        // Part headers are captured verbatim for re-emission to the backend
        let part_headers: Vec<(String, String)> = field
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect();
        let filename = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| "unknown".to_string());
        let declared_type = field
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| "application/octet-stream".to_string());

        ctx.enter_phase("upload_stream");
        loop {
            let chunk = timeout(config.upload_timeout, field.chunk())
                .await
                .map_err(|_| GateError::Timeout("client stalled during upload".to_string()))?
                .map_err(|e| GateError::Upload(format!("Failed to read file data: {}", e)))?;
            let Some(chunk) = chunk else { break };

            let mut guard = buffer.lock().await;
            // Ingest granularity follows the configured chunk size even
            // when the parser hands over larger reads
            for piece in chunk.chunks(config.upload_chunk_size.max(1)) {
                guard.append(piece).await.map_err(|e| match e {
                    avgate_processing::BufferError::FileTooLarge { attempted, max } => {
                        GateError::Memory(format!(
                            "{} bytes exceeds the {} byte cap",
                            attempted, max
                        ))
                    }
                    avgate_processing::BufferError::Io(e) => {
                        GateError::Internal(format!("spool write failed: {}", e))
                    }
                })?;
                ctx.operations += 1;
            }
            ctx.bytes_processed += chunk.len() as u64;

            let stats = guard.stats();
            let mut tracker = ctx.tracker.lock().expect("tracker lock");
            tracker.touch(buffer_id, stats.memory_size);
            if !spool_registered {
                if let Some(path) = guard.spool_path() {
                    tracker.register(
                        ResourceKind::TempFile,
                        path.display().to_string(),
                        stats.disk_size,
                    );
                    spool_registered = true;
                }
            }
        }

        return Ok(UploadedPart {
            part_headers,
            filename,
            declared_type,
        });
    }
}

/// Sniffs the content type and validates it against the declared one.
async fn check_mime(
    ctx: &mut RequestContext,
    buffer: &Arc<Mutex<SpoolBuffer>>,
    part: &UploadedPart,
) -> Result<(), GateError> {
    let (preview, spool_path) = {
        let guard = buffer.lock().await;
        let preview = guard
            .preview(MAGIC_WINDOW)
            .await
            .map_err(|e| GateError::Internal(format!("preview read failed: {}", e)))?;
        (preview, guard.spool_path().map(|p| p.to_path_buf()))
    };

    let detection = timeout(
        std::time::Duration::from_secs(3),
        sniff(&preview, Some(&part.filename), spool_path.as_deref(), true),
    )
    .await
    .map_err(|_| GateError::Timeout("content-type detection stalled".to_string()))?;
    ctx.operations += 1;

    tracing::debug!(
        request_id = %ctx.request_id,
        filename = %sanitize_filename(&part.filename),
        mime = %detection.mime,
        method = detection.method.as_str(),
        declared = %part.declared_type,
        "Content type detected"
    );

    let validation = validate_declared_type(&detection.mime, &part.declared_type);
    if !validation.ok {
        return Err(GateError::Mime(format!(
            "declared '{}' but content is '{}' ({})",
            part.declared_type, detection.mime, validation.reason
        )));
    }
    Ok(())
}

/// Runs the REQMOD exchange and interprets the verdict. IO failures count
/// against the breaker; completed exchanges, including blocks, do not.
async fn scan_with_icap(
    state: &AppState,
    ctx: &mut RequestContext,
    config: &GateConfig,
    buffer: &Arc<Mutex<SpoolBuffer>>,
    total_size: u64,
) -> Result<(), GateError> {
    state.icap_breaker.check().map_err(|remaining| {
        GateError::CircuitOpen(format!(
            "virus scanner circuit open, retry in {}s",
            remaining.as_secs().max(1)
        ))
    })?;

    let socket_id = ctx
        .tracker
        .lock()
        .expect("tracker lock")
        .register(ResourceKind::Socket, "icap connection", 0);
    {
        let tracker = ctx.tracker.clone();
        ctx.add_cleanup(90, "close_icap_socket", move || async move {
            // The socket itself closes when the exchange future drops;
            // this marks the bookkeeping entry for aborted scans.
            if let Ok(mut tracker) = tracker.lock() {
                tracker.release(socket_id);
            }
            Ok(())
        });
    }

    let scan_deadline = config.transfer_timeout_for(total_size);
    let result = {
        let guard = buffer.lock().await;
        timeout(scan_deadline, state.icap.scan(&guard)).await
    };
    ctx.tracker
        .lock()
        .expect("tracker lock")
        .release(socket_id);
    ctx.operations += 1;

    let verdict = match result {
        Err(_) => {
            state.icap_breaker.record_failure();
            return Err(GateError::Timeout(format!(
                "icap_scan exceeded {}s",
                scan_deadline.as_secs()
            )));
        }
        Ok(Err(IcapError::Timeout(d))) => {
            state.icap_breaker.record_failure();
            return Err(GateError::Timeout(format!(
                "ICAP socket idle past {}s",
                d.as_secs()
            )));
        }
        Ok(Err(e)) => {
            state.icap_breaker.record_failure();
            return Err(GateError::IcapConnection(e.to_string()));
        }
        Ok(Ok(verdict)) => verdict,
    };

    match verdict {
        IcapVerdict::Clean => {
            state.icap_breaker.record_success();
            tracing::debug!(request_id = %ctx.request_id, "Scan verdict: clean");
            Ok(())
        }
        IcapVerdict::Blocked {
            is_size_limit: true,
            ..
        } if config.limits_exceeded_behaviour == LimitsExceededBehaviour::Allow => {
            state.icap_breaker.record_success();
            tracing::warn!(
                request_id = %ctx.request_id,
                bytes = total_size,
                "Scanner size limit exceeded; passing through per configuration"
            );
            Ok(())
        }
        IcapVerdict::Blocked {
            http_code, message, ..
        } => {
            state.icap_breaker.record_success();
            Err(GateError::IcapScan(format!("{} ({})", message, http_code)))
        }
        IcapVerdict::ProtocolError { detail } => {
            // Unintelligible scanner counts as an unhealthy one, and the
            // upload is blocked rather than waved through
            state.icap_breaker.record_failure();
            Err(GateError::IcapScan(format!(
                "scanner protocol error: {}",
                detail
            )))
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward_to_backend(
    state: &AppState,
    ctx: &mut RequestContext,
    config: &GateConfig,
    buffer: &Arc<Mutex<SpoolBuffer>>,
    total_size: u64,
    uri: &Uri,
    headers: &HeaderMap,
    part: UploadedPart,
    forwarded: ForwardedContext,
) -> Result<reqwest::Response, GateError> {
    state.backend_breaker.check().map_err(|remaining| {
        GateError::CircuitOpen(format!(
            "backend circuit open, retry in {}s",
            remaining.as_secs().max(1)
        ))
    })?;

    let request_uri = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let request = ForwardRequest {
        url: config.backend_url(request_uri),
        headers: headers.clone(),
        part_headers: part.part_headers,
        reader: buffer.lock().await.reader(0),
        total_size,
        forwarded,
    };

    // Zero retries on this path: the upstream treats the upload as a
    // single-use token
    let result = state.forwarder.forward(request).await;
    ctx.operations += 1;

    match result {
        Ok(response) => {
            state.backend_breaker.record_success();
            Ok(response)
        }
        Err(ForwardError::Parameter(e)) => Err(GateError::Internal(e)),
        Err(ForwardError::Timeout(d)) => {
            state.backend_breaker.record_failure();
            Err(GateError::Timeout(format!(
                "backend_forward exceeded {}s",
                d.as_secs()
            )))
        }
        Err(e) => {
            state.backend_breaker.record_failure();
            Err(GateError::Backend(e.to_string()))
        }
    }
}
