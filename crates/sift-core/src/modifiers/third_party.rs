//! `$third-party` modifier.

use std::net::IpAddr;

use http::request;

use super::{referer_host, request_host};

/// Matches cross-site requests, or same-site requests when inverted.
///
/// Uses `Sec-Fetch-Site` when present and otherwise compares the
/// registrable domains of the `Referer` and the request.
#[derive(Debug, Clone, PartialEq)]
pub struct ThirdPartyModifier {
    inverted: bool,
}

impl ThirdPartyModifier {
    pub(crate) fn new(inverted: bool) -> Self {
        Self { inverted }
    }

    pub(crate) fn should_match_req(&self, req: &request::Parts) -> bool {
        match is_third_party(req) {
            Some(third_party) => third_party != self.inverted,
            None => false,
        }
    }
}

/// `None` when the request has no site context, such as a navigation the
/// user started.
fn is_third_party(req: &request::Parts) -> Option<bool> {
    if let Some(site) = req
        .headers
        .get("sec-fetch-site")
        .and_then(|v| v.to_str().ok())
    {
        return match site {
            "cross-site" => Some(true),
            "same-origin" | "same-site" => Some(false),
            _ => None,
        };
    }

    let referer = referer_host(req)?;
    let host = request_host(req)?;
    Some(site(&host) != site(&referer))
}

/// Registrable domain (eTLD+1) of `host`. IP literals and hosts without a
/// public suffix stand for themselves.
fn site(host: &str) -> &str {
    let host = host.trim_end_matches('.');
    if host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().is_ok() {
        return host;
    }
    psl::domain_str(host).unwrap_or(host)
}
