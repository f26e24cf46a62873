//! ICAP REQMOD client.
//!
//! One TCP connection per scan, closed when the exchange ends. The client
//! sends the configured preview as a single HTTP/1.1 chunk and handles the
//! three server answers: 204 (clean), 100 (send the rest), and anything
//! else (blocked). All line terminators on the wire are CRLF and chunk
//! sizes are uppercase hex.

use std::time::Duration;

use avgate_core::GateConfig;
use avgate_processing::SpoolBuffer;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::verdict::IcapVerdict;

/// Exact terminator for the 100-Continue body path.
const IEOF_TERMINATOR: &[u8] = b"0; ieof\r\n\r\n";

/// Header substring the scanner emits when its own size cap was hit.
const SIZE_LIMIT_MARKER: &str = "Heuristics.Limits.Exceeded.MaxFileSize";

#[derive(Debug, thiserror::Error)]
pub enum IcapError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("ICAP IO failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("ICAP exchange timed out after {0:?}")]
    Timeout(Duration),
}

pub struct IcapClient {
    host: String,
    port: u16,
    service: String,
    preview_size: usize,
    socket_timeout: Duration,
    log_traffic: bool,
}

impl IcapClient {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            host: config.icap_host.clone(),
            port: config.icap_port,
            service: config.icap_service.clone(),
            preview_size: config.icap_preview_size,
            socket_timeout: config.socket_timeout,
            log_traffic: config.log_icap_traffic,
        }
    }

    /// Runs one REQMOD exchange over the buffer contents.
    ///
    /// IO failures and timeouts surface as `IcapError` (the caller counts
    /// them against the circuit breaker); every parsed server answer comes
    /// back as a verdict.
    pub async fn scan(&self, buffer: &SpoolBuffer) -> Result<IcapVerdict, IcapError> {
        let total_size = buffer.total_size();
        let deadline = scaled_timeout(self.socket_timeout, total_size);
        let addr = format!("{}:{}", self.host, self.port);

        let stream = timed(deadline, TcpStream::connect(&addr))
            .await?
            .map_err(|source| IcapError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let preview = buffer
            .preview(self.preview_size)
            .await
            .map_err(|e| IcapError::Io(std::io::Error::other(e.to_string())))?;

        self.send_preview(&mut write_half, deadline, total_size, &preview)
            .await?;

        let status = read_crlf_line(&mut reader, deadline).await?;
        if self.log_traffic {
            tracing::debug!(status = %status, "ICAP preview response");
        }

        match parse_icap_status(&status) {
            Some(204) => Ok(IcapVerdict::Clean),
            Some(100) => {
                // Server wants the remainder before deciding
                self.drain_headers(&mut reader, deadline).await?;
                self.send_remainder(&mut write_half, deadline, buffer, preview.len())
                    .await?;

                // One empty line precedes the final status
                let mut line = read_crlf_line(&mut reader, deadline).await?;
                if line.is_empty() {
                    line = read_crlf_line(&mut reader, deadline).await?;
                }
                if self.log_traffic {
                    tracing::debug!(status = %line, "ICAP final response");
                }
                match parse_icap_status(&line) {
                    Some(204) => Ok(IcapVerdict::Clean),
                    Some(code) => self.read_blocked(&mut reader, deadline, code, &line).await,
                    None => Ok(blocked_on_parse_failure(&line)),
                }
            }
            Some(code) => self.read_blocked(&mut reader, deadline, code, &status).await,
            None => Ok(blocked_on_parse_failure(&status)),
        }
    }

    async fn send_preview(
        &self,
        write_half: &mut OwnedWriteHalf,
        deadline: Duration,
        total_size: u64,
        preview: &[u8],
    ) -> Result<(), IcapError> {
        let http_head = format!(
            "POST / HTTP/1.1\r\nHost: example.com\r\nContent-Length: {}\r\n\r\n",
            total_size
        );
        let icap_head = format!(
            "REQMOD icap://{host}:{port}/{service} ICAP/1.0\r\n\
             Host: {host}\r\n\
             Allow: 204\r\n\
             Preview: {preview_size}\r\n\
             Encapsulated: req-hdr=0, req-body={body_offset}\r\n\r\n",
            host = self.host,
            port = self.port,
            service = self.service,
            preview_size = self.preview_size,
            body_offset = http_head.len(),
        );

        if self.log_traffic {
            tracing::debug!(request = %icap_head, bytes = preview.len(), "ICAP preview request");
        }

        let mut message = Vec::with_capacity(icap_head.len() + http_head.len() + preview.len() + 32);
        message.extend_from_slice(icap_head.as_bytes());
        message.extend_from_slice(http_head.as_bytes());
        message.extend_from_slice(format!("{:X}\r\n", preview.len()).as_bytes());
        message.extend_from_slice(preview);
        message.extend_from_slice(b"\r\n0\r\n\r\n");

        timed(deadline, write_half.write_all(&message)).await??;
        timed(deadline, write_half.flush()).await??;
        Ok(())
    }

    /// Sends `total - preview` bytes as one chunk, then the ieof
    /// terminator. A file that fit inside the preview sends the terminator
    /// alone.
    async fn send_remainder(
        &self,
        write_half: &mut OwnedWriteHalf,
        deadline: Duration,
        buffer: &SpoolBuffer,
        preview_len: usize,
    ) -> Result<(), IcapError> {
        let remaining = buffer.total_size() - preview_len as u64;
        if remaining > 0 {
            timed(
                deadline,
                write_half.write_all(format!("{:X}\r\n", remaining).as_bytes()),
            )
            .await??;

            let mut reader = buffer.reader(preview_len as u64);
            let mut sent: u64 = 0;
            while let Some(chunk) = reader
                .next_chunk()
                .await
                .map_err(IcapError::Io)?
            {
                timed(deadline, write_half.write_all(&chunk)).await??;
                sent += chunk.len() as u64;
            }
            debug_assert_eq!(sent, remaining);
            timed(deadline, write_half.write_all(b"\r\n")).await??;

            if self.log_traffic {
                tracing::debug!(bytes = sent, "ICAP remainder sent");
            }
        }
        timed(deadline, write_half.write_all(IEOF_TERMINATOR)).await??;
        timed(deadline, write_half.flush()).await??;
        Ok(())
    }

    /// Consumes header lines after a `100 Continue` status.
    async fn drain_headers(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        deadline: Duration,
    ) -> Result<(), IcapError> {
        loop {
            let line = read_crlf_line(reader, deadline).await?;
            if line.is_empty() {
                return Ok(());
            }
        }
    }

    /// Collects the blocked response: ICAP headers up to the blank line,
    /// then the optional embedded HTTP status line.
    async fn read_blocked(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        deadline: Duration,
        icap_code: u16,
        status_line: &str,
    ) -> Result<IcapVerdict, IcapError> {
        let mut raw_headers = Vec::new();
        loop {
            match read_crlf_line_opt(reader, deadline).await? {
                Some(line) if line.is_empty() => break,
                Some(line) => raw_headers.push(line),
                None => break,
            }
        }

        let mut http_code = icap_code;
        let mut message = status_reason(status_line).unwrap_or_else(|| "blocked".to_string());
        if let Some(embedded) = read_crlf_line_opt(reader, deadline).await? {
            if let Some((code, reason)) = parse_http_status(&embedded) {
                http_code = code;
                message = reason;
            }
        }

        let is_size_limit = raw_headers.iter().any(|h| h.contains(SIZE_LIMIT_MARKER));
        if self.log_traffic {
            tracing::debug!(
                icap_code,
                http_code,
                is_size_limit,
                headers = raw_headers.len(),
                "ICAP blocked response"
            );
        }

        Ok(IcapVerdict::Blocked {
            http_code,
            message,
            is_size_limit,
            raw_headers,
        })
    }
}

/// A response that does not parse as ICAP at all is treated as a block,
/// not a scanner failure. There is no numeric code to surface, so the raw
/// line rides along in the message.
fn blocked_on_parse_failure(line: &str) -> IcapVerdict {
    IcapVerdict::Blocked {
        http_code: 0,
        message: format!("unparseable status line: {:?}", line),
        is_size_limit: false,
        raw_headers: Vec::new(),
    }
}

fn scaled_timeout(base: Duration, total_size: u64) -> Duration {
    if total_size > avgate_core::config::LARGE_PAYLOAD_BYTES {
        base * 5
    } else {
        base
    }
}

async fn timed<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, IcapError> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| IcapError::Timeout(deadline))
}

/// Reads one CRLF-terminated line; EOF before any byte is an error.
async fn read_crlf_line(
    reader: &mut BufReader<OwnedReadHalf>,
    deadline: Duration,
) -> Result<String, IcapError> {
    read_crlf_line_opt(reader, deadline)
        .await?
        .ok_or_else(|| IcapError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)))
}

/// Reads one CRLF-terminated line; `None` on clean EOF.
async fn read_crlf_line_opt(
    reader: &mut BufReader<OwnedReadHalf>,
    deadline: Duration,
) -> Result<Option<String>, IcapError> {
    let mut line = String::new();
    let n = timed(deadline, reader.read_line(&mut line)).await??;
    if n == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

fn parse_icap_status(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("ICAP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn parse_http_status(line: &str) -> Option<(u16, String)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let code = parts.next()?.parse().ok()?;
    let reason = parts.next().unwrap_or("").to_string();
    Some((code, reason))
}

fn status_reason(line: &str) -> Option<String> {
    line.splitn(3, ' ').nth(2).map(|s| s.to_string())
}
