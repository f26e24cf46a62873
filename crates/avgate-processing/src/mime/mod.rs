//! Content-type detection for uploaded files.
//!
//! Detection tiers, tried in order until one produces a specific answer:
//!
//! 1. the external `file` command (bounded to 2s, optional),
//! 2. a text-content heuristic over the first 512 bytes,
//! 3. the magic-number table over the first KiB,
//! 4. the text-extension table,
//! 5. `application/octet-stream`.

mod external;
mod magic;
mod text;
mod validate;

use std::path::Path;

pub use magic::{match_magic, MAGIC_WINDOW};
pub use text::{looks_like_text, text_mime_for_extension, TEXT_WINDOW};
pub use validate::{validate_declared_type, MimeValidation};

/// Minimum preview length before the external probe is worth invoking.
const EXTERNAL_MIN_BYTES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionMethod {
    External,
    TextHeuristic,
    Magic,
    Extension,
    Fallback,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::External => "external",
            DetectionMethod::TextHeuristic => "text_heuristic",
            DetectionMethod::Magic => "magic",
            DetectionMethod::Extension => "extension",
            DetectionMethod::Fallback => "fallback",
        }
    }
}

/// A detection result. `mime` is always populated.
#[derive(Clone, Debug)]
pub struct Detection {
    pub mime: String,
    pub method: DetectionMethod,
    pub detail: Option<String>,
}

/// Detects the content type of an upload from its preview bytes.
///
/// `spool_path` is the upload's temp file when it has one; memory-resident
/// uploads are probed through a scratch file. External probe failures are
/// recoverable and fall through to the next tier.
pub async fn sniff(
    preview: &[u8],
    filename: Option<&str>,
    spool_path: Option<&Path>,
    allow_external: bool,
) -> Detection {
    let extension = filename.and_then(extension_of);

    if allow_external && preview.len() >= EXTERNAL_MIN_BYTES {
        let probed = match spool_path {
            Some(path) => external::probe_path(path).await,
            None => external::probe_bytes(preview).await,
        };
        match probed {
            Ok(mime) => {
                return Detection {
                    mime,
                    method: DetectionMethod::External,
                    detail: Some("file_command".to_string()),
                };
            }
            Err(e) => {
                tracing::debug!(error = %e, "External MIME probe missed, using heuristics");
            }
        }
    }

    if looks_like_text(preview) {
        let mime = extension
            .as_deref()
            .and_then(text_mime_for_extension)
            .unwrap_or("text/plain");
        return Detection {
            mime: mime.to_string(),
            method: DetectionMethod::TextHeuristic,
            detail: extension.clone(),
        };
    }

    if let Some((mime, detail)) = match_magic(preview) {
        return Detection {
            mime: mime.to_string(),
            method: DetectionMethod::Magic,
            detail: Some(detail.to_string()),
        };
    }

    if let Some(mime) = extension.as_deref().and_then(text_mime_for_extension) {
        return Detection {
            mime: mime.to_string(),
            method: DetectionMethod::Extension,
            detail: extension,
        };
    }

    Detection {
        mime: "application/octet-stream".to_string(),
        method: DetectionMethod::Fallback,
        detail: None,
    }
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}
