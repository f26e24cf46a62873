//! IP address extraction utilities
//!
//! Extracts the client IP for the X-Forwarded-For / X-Real-IP headers the
//! forwarder adds, preferring upstream-provided forwarding headers over
//! the raw socket address and validating everything before trusting it.

use axum::http::HeaderMap;
use std::net::IpAddr;

/// Extract and validate the client IP from request headers.
///
/// Falls back to the direct socket address when no forwarding header is
/// present or parseable, then to "unknown".
pub fn extract_client_ip(
    headers: &HeaderMap,
    socket_addr: Option<&std::net::SocketAddr>,
) -> String {
    if let Some(forwarded_for) = headers.get("x-forwarded-for") {
        if let Ok(header_value) = forwarded_for.to_str() {
            // First entry in the chain is the originating client
            if let Some(first) = header_value.split(',').map(str::trim).find(|s| !s.is_empty())
            {
                if is_valid_ip(first) {
                    return first.to_string();
                }
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(header_value) = real_ip.to_str() {
            let trimmed = header_value.trim();
            if is_valid_ip(trimmed) {
                return trimmed.to_string();
            }
        }
    }

    if let Some(addr) = socket_addr {
        return addr.ip().to_string();
    }

    "unknown".to_string()
}

fn is_valid_ip(ip_str: &str) -> bool {
    ip_str.parse::<IpAddr>().is_ok()
}
