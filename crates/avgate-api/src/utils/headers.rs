//! Header filtering for the relay direction.

use axum::http::HeaderMap;

/// Hop-by-hop headers that must not be copied from the backend response to
/// the client; the relay re-frames the body itself.
const HOP_BY_HOP: &[&str] = &["connection", "transfer-encoding", "content-length"];

/// Copies `inbound` minus hop-by-hop headers.
pub fn strip_hop_by_hop(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn strips_hop_by_hop_headers_only() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("content-length", HeaderValue::from_static("42"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-upstream", HeaderValue::from_static("dms"));

        let out = strip_hop_by_hop(&headers);
        assert_eq!(out.len(), 2);
        assert!(out.contains_key("content-type"));
        assert!(out.contains_key("x-upstream"));
    }
}
