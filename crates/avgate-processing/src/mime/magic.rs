//! Magic-number detection over the first KiB of an upload.
//!
//! Checks run in a fixed priority order: specific container formats before
//! generic ones (notably ZIP-packaged office documents before bare ZIP),
//! and ICO last-resort signatures only under a strict secondary check.

/// Number of leading bytes the matcher inspects.
pub const MAGIC_WINDOW: usize = 1024;

/// Matches `head` (up to 1 KiB) against the magic table.
///
/// Returns `(mime, detail)` for the first match in priority order.
pub fn match_magic(head: &[u8]) -> Option<(&'static str, &'static str)> {
    let head = &head[..head.len().min(MAGIC_WINDOW)];
    if head.len() < 4 {
        return None;
    }

    // Documents
    if head.starts_with(b"%PDF") {
        return Some(("application/pdf", "pdf_signature"));
    }
    if head.starts_with(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]) {
        return Some(("application/msword", "ole_compound"));
    }

    // ZIP-packaged containers, before bare ZIP
    if head.starts_with(b"PK") {
        if contains(head, b"word/") {
            return Some((
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                "ooxml_word",
            ));
        }
        if contains(head, b"xl/") {
            return Some((
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                "ooxml_excel",
            ));
        }
        if contains(head, b"ppt/") {
            return Some((
                "application/vnd.openxmlformats-officedocument.presentationml.presentation",
                "ooxml_powerpoint",
            ));
        }
        if contains(head, b"META-INF/MANIFEST.MF") {
            return Some(("application/java-archive", "jar_manifest"));
        }
    }

    // Images
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(("image/jpeg", "jpeg_signature"));
    }
    if head.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(("image/png", "png_signature"));
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return Some(("image/gif", "gif_signature"));
    }
    if riff_form(head, b"WEBP") {
        return Some(("image/webp", "riff_webp"));
    }
    if head.starts_with(b"BM") && head.len() >= 14 {
        return Some(("image/bmp", "bmp_signature"));
    }
    if head.starts_with(&[0x49, 0x49, 0x2A, 0x00]) || head.starts_with(&[0x4D, 0x4D, 0x00, 0x2A]) {
        return Some(("image/tiff", "tiff_signature"));
    }

    // Archives
    if head.starts_with(&[0x50, 0x4B, 0x03, 0x04])
        || head.starts_with(&[0x50, 0x4B, 0x05, 0x06])
        || head.starts_with(&[0x50, 0x4B, 0x07, 0x08])
    {
        return Some(("application/zip", "zip_signature"));
    }
    if head.starts_with(b"Rar!\x1a\x07") {
        return Some(("application/vnd.rar", "rar_signature"));
    }
    if head.starts_with(&[0x1F, 0x8B]) {
        return Some(("application/gzip", "gzip_signature"));
    }
    if head.starts_with(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C]) {
        return Some(("application/x-7z-compressed", "7z_signature"));
    }
    if head.starts_with(b"BZh") {
        return Some(("application/x-bzip2", "bzip2_signature"));
    }
    if head.starts_with(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]) {
        return Some(("application/x-xz", "xz_signature"));
    }

    // Audio
    if head.starts_with(b"ID3")
        || head.starts_with(&[0xFF, 0xFB])
        || head.starts_with(&[0xFF, 0xF3])
        || head.starts_with(&[0xFF, 0xF2])
    {
        return Some(("audio/mpeg", "mp3_signature"));
    }
    if head.starts_with(b"OggS") {
        return Some(("audio/ogg", "ogg_signature"));
    }
    if riff_form(head, b"WAVE") {
        return Some(("audio/wav", "riff_wave"));
    }
    if head.starts_with(b"fLaC") {
        return Some(("audio/flac", "flac_signature"));
    }
    if ftyp_brand(head, b"M4A ") {
        return Some(("audio/mp4", "ftyp_m4a"));
    }

    // Video
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return Some(("video/mp4", "ftyp_container"));
    }
    if riff_form(head, b"AVI ") {
        return Some(("video/x-msvideo", "riff_avi"));
    }
    if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(("video/webm", "ebml_signature"));
    }
    if head.starts_with(&[0x00, 0x00, 0x01, 0xBA]) || head.starts_with(&[0x00, 0x00, 0x01, 0xB3]) {
        return Some(("video/mpeg", "mpeg_ps_signature"));
    }

    // Text-like structured formats
    if let Some(mime) = match_markup(head) {
        return Some(mime);
    }

    // Executables
    if head.starts_with(b"MZ") {
        return Some(("application/x-msdownload", "pe_signature"));
    }
    if head.starts_with(&[0x7F, 0x45, 0x4C, 0x46]) {
        return Some(("application/x-executable", "elf_signature"));
    }
    if head.starts_with(&[0xCA, 0xFE, 0xBA, 0xBE]) {
        return Some(("application/java-vm", "class_signature"));
    }
    if head.starts_with(&[0xFE, 0xED, 0xFA, 0xCE])
        || head.starts_with(&[0xFE, 0xED, 0xFA, 0xCF])
        || head.starts_with(&[0xCE, 0xFA, 0xED, 0xFE])
        || head.starts_with(&[0xCF, 0xFA, 0xED, 0xFE])
    {
        return Some(("application/x-mach-binary", "macho_signature"));
    }

    // Fonts
    if head.starts_with(&[0x00, 0x01, 0x00, 0x00]) {
        return Some(("font/ttf", "ttf_signature"));
    }
    if head.starts_with(b"OTTO") {
        return Some(("font/otf", "otf_signature"));
    }
    if head.starts_with(b"wOFF") {
        return Some(("font/woff", "woff_signature"));
    }
    if head.starts_with(b"wOF2") {
        return Some(("font/woff2", "woff2_signature"));
    }

    // ICO is a weak 00 00 01 00 prefix; require a plausible directory
    if ico_strict(head) {
        return Some(("image/x-icon", "ico_signature"));
    }

    None
}

fn match_markup(head: &[u8]) -> Option<(&'static str, &'static str)> {
    let trimmed = trim_leading_whitespace(head);
    let lower: Vec<u8> = trimmed
        .iter()
        .take(64)
        .map(|b| b.to_ascii_lowercase())
        .collect();

    if lower.starts_with(b"<!doctype html") || lower.starts_with(b"<html") {
        return Some(("text/html", "html_signature"));
    }
    if lower.starts_with(b"<?xml") {
        return Some(("application/xml", "xml_signature"));
    }
    if (trimmed.starts_with(b"{") || trimmed.starts_with(b"[")) && looks_like_json(trimmed) {
        return Some(("application/json", "json_signature"));
    }
    None
}

fn looks_like_json(head: &[u8]) -> bool {
    // Cheap structural sniff: opening brace/bracket followed by a quote,
    // digit, or matching close within the window
    head.iter().skip(1).take(128).any(|&b| {
        matches!(
            b,
            b'"' | b'0'..=b'9' | b'{' | b'[' | b']' | b'}' | b't' | b'f' | b'n'
        )
    })
}

fn trim_leading_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// RIFF container whose form tag (bytes 8..12) is `form`.
fn riff_form(head: &[u8], form: &[u8; 4]) -> bool {
    head.len() >= 12 && head.starts_with(b"RIFF") && &head[8..12] == form
}

/// ISO base-media container whose major brand (bytes 8..12) is `brand`.
fn ftyp_brand(head: &[u8], brand: &[u8; 4]) -> bool {
    head.len() >= 12 && &head[4..8] == b"ftyp" && &head[8..12] == brand
}

/// ICO: reserved word zero, type 1, and a directory that actually parses
/// (1-64 images, reserved entry byte zero).
fn ico_strict(head: &[u8]) -> bool {
    if head.len() < 10 || !head.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
        return false;
    }
    let count = u16::from_le_bytes([head[4], head[5]]);
    (1..=64).contains(&count) && head[9] == 0
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mime_of(bytes: &[u8]) -> Option<&'static str> {
        match_magic(bytes).map(|(mime, _)| mime)
    }

    #[test]
    fn detects_common_documents() {
        assert_eq!(mime_of(b"%PDF-1.7 rest"), Some("application/pdf"));
        assert_eq!(
            mime_of(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1, 0, 0]),
            Some("application/msword")
        );
    }

    #[test]
    fn office_containers_win_over_bare_zip() {
        let mut docx = b"PK\x03\x04".to_vec();
        docx.extend_from_slice(b"\x14\x00\x00\x00word/document.xml");
        assert_eq!(
            mime_of(&docx),
            Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
        );

        let mut jar = b"PK\x03\x04".to_vec();
        jar.extend_from_slice(b"....META-INF/MANIFEST.MF");
        assert_eq!(mime_of(&jar), Some("application/java-archive"));

        assert_eq!(
            mime_of(b"PK\x03\x04plain zip entry"),
            Some("application/zip")
        );
    }

    #[test]
    fn detects_images() {
        assert_eq!(mime_of(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]), Some("image/jpeg"));
        assert_eq!(
            mime_of(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 1, 2]),
            Some("image/png")
        );
        assert_eq!(mime_of(b"GIF89a......"), Some("image/gif"));
        assert_eq!(mime_of(b"RIFF\x10\x00\x00\x00WEBPVP8 "), Some("image/webp"));
        assert_eq!(
            mime_of(&[0x49, 0x49, 0x2A, 0x00, 0, 0]),
            Some("image/tiff")
        );
    }

    #[test]
    fn riff_forms_do_not_collide() {
        assert_eq!(mime_of(b"RIFF\x10\x00\x00\x00WAVEfmt "), Some("audio/wav"));
        assert_eq!(
            mime_of(b"RIFF\x10\x00\x00\x00AVI LIST"),
            Some("video/x-msvideo")
        );
    }

    #[test]
    fn m4a_brand_wins_over_generic_ftyp() {
        assert_eq!(
            mime_of(b"\x00\x00\x00\x20ftypM4A \x00\x00\x00\x00"),
            Some("audio/mp4")
        );
        assert_eq!(
            mime_of(b"\x00\x00\x00\x20ftypisom\x00\x00\x02\x00"),
            Some("video/mp4")
        );
    }

    #[test]
    fn detects_markup_and_json() {
        assert_eq!(mime_of(b"  <!DOCTYPE HTML><html>"), Some("text/html"));
        assert_eq!(mime_of(b"<?xml version=\"1.0\"?>"), Some("application/xml"));
        assert_eq!(mime_of(b"{\"ok\": true}"), Some("application/json"));
    }

    #[test]
    fn detects_executables() {
        assert_eq!(mime_of(b"MZ\x90\x00"), Some("application/x-msdownload"));
        assert_eq!(
            mime_of(&[0x7F, 0x45, 0x4C, 0x46, 2, 1]),
            Some("application/x-executable")
        );
        assert_eq!(
            mime_of(&[0xCA, 0xFE, 0xBA, 0xBE, 0, 0]),
            Some("application/java-vm")
        );
    }

    #[test]
    fn ico_requires_plausible_directory() {
        // Valid: 1 image, reserved byte zero
        let ico = [0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 16, 16, 0, 0, 1, 0];
        assert_eq!(mime_of(&ico), Some("image/x-icon"));

        // Zero images: not an ICO
        let not_ico = [0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0, 0, 0, 0];
        assert_eq!(mime_of(&not_ico), None);

        // Implausible image count
        let not_ico = [0x00, 0x00, 0x01, 0x00, 0xFF, 0x40, 0, 0, 0, 0];
        assert_eq!(mime_of(&not_ico), None);
    }

    #[test]
    fn unknown_bytes_match_nothing() {
        assert_eq!(mime_of(&[0x42, 0x13, 0x37, 0x00, 0x01]), None);
        assert_eq!(mime_of(b"xy"), None);
    }
}
