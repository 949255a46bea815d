//! Header helpers for forwarding.

use http::header::{self, HeaderMap, HeaderName};

/// Hop-by-hop headers that must not be forwarded (RFC 7230 section 6.1).
const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any named in `Connection`.
pub fn remove_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in &listed {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Returns true if any comma-separated value of `name` equals `token`, ignoring case.
pub fn header_contains_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case(token))
}

/// Returns true for a WebSocket upgrade handshake.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    header_contains_token(headers, &header::CONNECTION, "upgrade")
        && header_contains_token(headers, &header::UPGRADE, "websocket")
}
