//! Upload validation: extension allow-list and filename hygiene.

#[derive(Debug, thiserror::Error)]
pub enum UploadValidationError {
    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    #[error("Invalid file extension: {extension} (allowed: {allowed:?})")]
    ExtensionNotAllowed {
        extension: String,
        allowed: Vec<String>,
    },

    #[error("Empty file")]
    EmptyFile,
}

/// Validates the filename extension against the allow-list and returns the
/// lowercase extension. An empty allow-list admits everything; a missing
/// extension is only rejected when an allow-list is active.
pub fn validate_extension(
    filename: &str,
    allowed: &[String],
) -> Result<String, UploadValidationError> {
    let extension = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    if allowed.is_empty() {
        return Ok(extension);
    }

    if extension.is_empty() || !allowed.contains(&extension) {
        return Err(UploadValidationError::ExtensionNotAllowed {
            extension,
            allowed: allowed.to_vec(),
        });
    }

    Ok(extension)
}

/// Sanitizes a client-supplied filename: strips any path component,
/// rejects traversal attempts, and replaces unsafe characters.
pub fn sanitize_filename(filename: &str) -> String {
    const MAX_FILENAME_LENGTH: usize = 255;

    let path = std::path::Path::new(filename);
    let filename_only = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(filename);

    if filename_only.contains("..") {
        return "invalid_filename".to_string();
    }

    let sanitized: String = filename_only
        .chars()
        .take(MAX_FILENAME_LENGTH)
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.trim().is_empty() || sanitized.len() < 3 {
        return "file".to_string();
    }

    sanitized
}
