//! `$removeheader=` modifier.

use http::{request, response, HeaderName};

use crate::error::{Result, RuleError};

/// Headers that rules may never strip. Any `Access-Control-*` header is
/// also protected.
const FORBIDDEN_HEADERS: &[&str] = &[
    "origin",
    "timing-allow-origin",
    "allow",
    "cross-origin-embedder-policy",
    "cross-origin-opener-policy",
    "cross-origin-resource-policy",
    "content-security-policy",
    "content-security-policy-report-only",
    "expect-ct",
    "feature-policy",
    "permissions-policy",
    "origin-isolation",
    "strict-transport-security",
    "upgrade-insecure-requests",
    "x-content-type-options",
    "x-download-options",
    "x-frame-options",
    "x-permitted-cross-domain-policies",
    "x-powered-by",
    "x-xss-protection",
    "public-key-pins",
    "public-key-pins-report-only",
    "sec-websocket-key",
    "sec-websocket-extensions",
    "sec-websocket-accept",
    "sec-websocket-protocol",
    "sec-websocket-version",
    "sec-fetch-mode",
    "sec-fetch-dest",
    "sec-fetch-site",
    "sec-fetch-user",
    "referrer-policy",
    "content-type",
    "content-length",
    "accept",
    "accept-encoding",
    "host",
    "connection",
    "transfer-encoding",
    "upgrade",
    "p3p",
];

fn is_forbidden(name: &HeaderName) -> bool {
    let name = name.as_str();
    name.starts_with("access-control-") || FORBIDDEN_HEADERS.contains(&name)
}

/// Which side of the exchange a header is removed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderScope {
    Request,
    Response,
}

/// Removes a header from requests (`removeheader=request:name`) or
/// responses (`removeheader=name`).
#[derive(Debug, Clone, PartialEq)]
pub struct RemoveHeaderModifier {
    name: HeaderName,
    scope: HeaderScope,
}

impl RemoveHeaderModifier {
    pub(crate) fn parse(value: &str) -> Result<Self> {
        let (scope, name) = match value.strip_prefix("request:") {
            Some(name) => (HeaderScope::Request, name),
            None => (HeaderScope::Response, value),
        };
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| RuleError::invalid("removeheader", e.to_string()))?;

        if is_forbidden(&name) {
            tracing::warn!("Refusing to remove protected header {}", name);
            return Err(RuleError::ForbiddenHeader(name.to_string()));
        }

        Ok(Self { name, scope })
    }

    pub(crate) fn modify_req(&self, req: &mut request::Parts) -> bool {
        self.scope == HeaderScope::Request && req.headers.remove(&self.name).is_some()
    }

    pub(crate) fn modify_res(&self, res: &mut response::Parts) -> bool {
        self.scope == HeaderScope::Response && res.headers.remove(&self.name).is_some()
    }
}
