//! External MIME probe via the `file` command.
//!
//! The probe is strictly bounded: two seconds wall-clock, after which the
//! child is killed and detection falls through to the built-in heuristics.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

/// Hard wall-clock cap on the external probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Most bytes ever written to a scratch file for a memory-mode probe.
const PROBE_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("probe returned no usable type: {0:?}")]
    Unusable(String),
}

/// Runs `file --mime-type -b <path>` under the 2s cap.
///
/// Returns the reported type only when it is specific; octet-stream and
/// `data` answers are treated as misses so the caller can fall through.
pub async fn probe_path(path: &Path) -> Result<String, ProbeError> {
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new("file")
            .arg("--mime-type")
            .arg("-b")
            .arg(path)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| ProbeError::Timeout(PROBE_TIMEOUT))??;

    if !output.status.success() {
        return Err(ProbeError::Unusable(format!(
            "file exited with {}",
            output.status
        )));
    }

    let mime = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if mime.is_empty() || mime == "data" || mime == "application/octet-stream" {
        return Err(ProbeError::Unusable(mime));
    }
    Ok(mime)
}

/// Probes in-memory preview bytes by spooling them to a scratch file first.
/// The scratch file lives only for the duration of the probe.
pub async fn probe_bytes(preview: &[u8]) -> Result<String, ProbeError> {
    let mut scratch = tempfile::NamedTempFile::new()?;
    scratch.write_all(&preview[..preview.len().min(PROBE_BYTES)])?;
    scratch.flush()?;
    probe_path(scratch.path()).await
}
