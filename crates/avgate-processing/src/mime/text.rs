//! Text-content heuristic and the text-extension table.

/// Bytes inspected by the text heuristic.
pub const TEXT_WINDOW: usize = 512;

/// Decides whether the first 512 bytes look like text: null-byte ratio at
/// most 1%, non-whitespace control ratio at most 10%, and printable or
/// UTF-8 byte ratio at least 90%.
pub fn looks_like_text(head: &[u8]) -> bool {
    let window = &head[..head.len().min(TEXT_WINDOW)];
    if window.is_empty() {
        return false;
    }

    let len = window.len() as f64;
    let mut nulls = 0usize;
    let mut controls = 0usize;
    let mut textual = 0usize;

    for &b in window {
        match b {
            0x00 => nulls += 1,
            b'\t' | b'\n' | b'\r' | 0x0B | 0x0C => textual += 1,
            0x01..=0x1F | 0x7F => controls += 1,
            // Printable ASCII and UTF-8 multi-byte sequences
            _ => textual += 1,
        }
    }

    nulls as f64 / len <= 0.01
        && controls as f64 / len <= 0.10
        && textual as f64 / len >= 0.90
}

/// Canonical text MIME type for a lowercase file extension.
pub fn text_mime_for_extension(extension: &str) -> Option<&'static str> {
    let mime = match extension {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "json" => "application/json",
        "xml" => "application/xml",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "ts" => "text/x-typescript",
        "py" => "text/x-python",
        "sh" => "text/x-shellscript",
        "sql" => "application/sql",
        "csv" => "text/csv",
        "yaml" | "yml" => "application/x-yaml",
        _ => return None,
    };
    Some(mime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ascii_is_text() {
        assert!(looks_like_text(b"hello world\nsecond line\r\n"));
    }

    #[test]
    fn utf8_content_is_text() {
        assert!(looks_like_text("grüße aus münchen — ß".as_bytes()));
    }

    #[test]
    fn binary_with_nulls_is_not_text() {
        let mut data = vec![b'a'; 400];
        data.extend_from_slice(&[0u8; 100]);
        assert!(!looks_like_text(&data));
    }

    #[test]
    fn control_heavy_content_is_not_text() {
        let mut data = vec![b'a'; 400];
        data.extend_from_slice(&[0x01u8; 100]);
        assert!(!looks_like_text(&data));
    }

    #[test]
    fn empty_input_is_not_text() {
        assert!(!looks_like_text(b""));
    }

    #[test]
    fn only_the_window_is_inspected() {
        let mut data = vec![b'a'; TEXT_WINDOW];
        data.extend_from_slice(&[0u8; 4096]);
        assert!(looks_like_text(&data));
    }

    #[test]
    fn extension_table_covers_the_common_cases() {
        assert_eq!(text_mime_for_extension("txt"), Some("text/plain"));
        assert_eq!(text_mime_for_extension("json"), Some("application/json"));
        assert_eq!(text_mime_for_extension("htm"), Some("text/html"));
        assert_eq!(text_mime_for_extension("yml"), Some("application/x-yaml"));
        assert_eq!(text_mime_for_extension("exe"), None);
    }
}
