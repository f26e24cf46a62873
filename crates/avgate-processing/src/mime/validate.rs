//! Validation of the detected type against the client-declared one.

/// Declared types that carry no information; validation always passes.
const GENERIC_TYPES: &[&str] = &[
    "application/octet-stream",
    "application/binary",
    "binary/octet-stream",
];

/// Known equivalences between detected and declared types, checked in both
/// directions. Office formats commonly arrive declared as octet-stream,
/// which the generic rule already admits.
const ALIASES: &[(&str, &str)] = &[
    ("image/jpeg", "image/jpg"),
    ("image/jpeg", "image/pjpeg"),
    ("application/javascript", "text/javascript"),
    ("application/x-sh", "text/x-shellscript"),
    ("application/xml", "text/xml"),
    ("application/zip", "application/x-zip-compressed"),
    ("audio/mpeg", "audio/mp3"),
    ("audio/wav", "audio/x-wav"),
    ("audio/wav", "audio/wave"),
    ("image/x-icon", "image/vnd.microsoft.icon"),
    ("video/x-msvideo", "video/avi"),
    ("application/msword", "application/vnd.ms-excel"),
    ("application/msword", "application/vnd.ms-powerpoint"),
];

/// Outcome of validating a detected type against the declared one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MimeValidation {
    pub ok: bool,
    pub reason: &'static str,
}

/// Validates `detected` against the `declared` Content-Type of the part.
///
/// Parameters (anything after `;`) are ignored and comparison is
/// case-insensitive.
pub fn validate_declared_type(detected: &str, declared: &str) -> MimeValidation {
    let declared = normalize(declared);
    let detected = normalize(detected);

    if GENERIC_TYPES.contains(&declared.as_str()) {
        return MimeValidation {
            ok: true,
            reason: "generic_header_override",
        };
    }

    if detected == declared {
        return MimeValidation {
            ok: true,
            reason: "exact_match",
        };
    }

    let aliased = ALIASES.iter().any(|(a, b)| {
        (*a == detected && *b == declared) || (*a == declared && *b == detected)
    });
    if aliased {
        return MimeValidation {
            ok: true,
            reason: "alias_match",
        };
    }

    MimeValidation {
        ok: false,
        reason: "mime_mismatch",
    }
}

fn normalize(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_lowercase()
}
