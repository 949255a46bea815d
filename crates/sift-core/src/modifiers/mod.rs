//! Rule modifiers.
//!
//! The part of a rule after `$` is a comma-separated list of modifiers.
//! Matching modifiers decide whether a rule applies to a request or
//! response. Modifying modifiers rewrite it in place instead of blocking.

mod content_type;
mod cookie;
mod domain;
mod header;
mod method;
mod pattern;
mod remove_header;
mod remove_param;
mod third_party;

pub use content_type::{ContentType, ContentTypeModifier};
pub use cookie::CookieModifier;
pub use domain::DomainModifier;
pub use header::HeaderModifier;
pub use method::MethodModifier;
pub use remove_header::{HeaderScope, RemoveHeaderModifier};
pub use remove_param::RemoveParamModifier;
pub use third_party::ThirdPartyModifier;

use http::{request, response};

use crate::error::{Result, RuleError};

/// A modifier that decides whether a rule applies.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchingModifier {
    Domain(DomainModifier),
    Method(MethodModifier),
    ContentType(ContentTypeModifier),
    ThirdParty(ThirdPartyModifier),
    Header(HeaderModifier),
}

impl MatchingModifier {
    /// Evaluates the modifier against a request.
    pub fn should_match_req(&self, req: &request::Parts) -> bool {
        match self {
            MatchingModifier::Domain(m) => m.should_match_req(req),
            MatchingModifier::Method(m) => m.should_match_req(req),
            MatchingModifier::ContentType(m) => m.should_match_req(req),
            MatchingModifier::ThirdParty(m) => m.should_match_req(req),
            MatchingModifier::Header(_) => false,
        }
    }

    /// Evaluates the modifier against a response.
    ///
    /// Request-scoped modifiers are evaluated against the request that
    /// produced the response.
    pub fn should_match_res(&self, req: &request::Parts, res: &response::Parts) -> bool {
        match self {
            MatchingModifier::Header(m) => m.should_match_res(res),
            other => other.should_match_req(req),
        }
    }

    fn is_content_type(&self) -> bool {
        matches!(self, MatchingModifier::ContentType(_))
    }
}

/// A modifier that rewrites a request or response in place.
#[derive(Debug, Clone, PartialEq)]
pub enum ModifyingModifier {
    RemoveParam(RemoveParamModifier),
    RemoveHeader(RemoveHeaderModifier),
    Cookie(CookieModifier),
}

impl ModifyingModifier {
    /// Applies the modifier to a request. Returns true if anything changed.
    pub fn modify_req(&self, req: &mut request::Parts) -> bool {
        match self {
            ModifyingModifier::RemoveParam(m) => m.modify_req(req),
            ModifyingModifier::RemoveHeader(m) => m.modify_req(req),
            ModifyingModifier::Cookie(m) => m.modify_req(req),
        }
    }

    /// Applies the modifier to a response. Returns true if anything changed.
    pub fn modify_res(&self, res: &mut response::Parts) -> bool {
        match self {
            ModifyingModifier::RemoveParam(_) => false,
            ModifyingModifier::RemoveHeader(m) => m.modify_res(res),
            ModifyingModifier::Cookie(m) => m.modify_res(res),
        }
    }
}

/// A single parsed modifier.
#[derive(Debug, Clone, PartialEq)]
pub enum Modifier {
    Matching(MatchingModifier),
    Modifying(ModifyingModifier),
}

impl Modifier {
    /// Parses one entry of a modifier list, e.g. `domain=a.com|~b.com`.
    ///
    /// Returns `Ok(None)` for modifiers that are accepted but have no
    /// effect at the network level (`all`).
    pub fn parse(raw: &str) -> Result<Option<Modifier>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RuleError::EmptyModifier);
        }

        let (name, value) = match raw.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (raw, None),
        };
        let (inverted, name) = match name.strip_prefix('~') {
            Some(name) => (true, name),
            None => (false, name),
        };

        let reject_inversion = |kind: &'static str| {
            if inverted {
                Err(RuleError::invalid(kind, "cannot be inverted"))
            } else {
                Ok(())
            }
        };
        let require_value = |kind: &'static str| {
            value
                .filter(|v| !v.is_empty())
                .ok_or_else(|| RuleError::invalid(kind, "missing value"))
        };

        let modifier = match name {
            "domain" => {
                reject_inversion("domain")?;
                Modifier::Matching(MatchingModifier::Domain(DomainModifier::parse(
                    require_value("domain")?,
                )?))
            }
            "method" => {
                reject_inversion("method")?;
                Modifier::Matching(MatchingModifier::Method(MethodModifier::parse(
                    require_value("method")?,
                )?))
            }
            "third-party" | "3p" => {
                if value.is_some() {
                    return Err(RuleError::invalid("third-party", "takes no value"));
                }
                Modifier::Matching(MatchingModifier::ThirdParty(ThirdPartyModifier::new(inverted)))
            }
            "header" => {
                reject_inversion("header")?;
                Modifier::Matching(MatchingModifier::Header(HeaderModifier::parse(
                    require_value("header")?,
                )?))
            }
            "removeparam" => {
                reject_inversion("removeparam")?;
                Modifier::Modifying(ModifyingModifier::RemoveParam(RemoveParamModifier::parse(
                    value,
                )?))
            }
            "removeheader" => {
                reject_inversion("removeheader")?;
                Modifier::Modifying(ModifyingModifier::RemoveHeader(
                    RemoveHeaderModifier::parse(require_value("removeheader")?)?,
                ))
            }
            "cookie" => {
                reject_inversion("cookie")?;
                Modifier::Modifying(ModifyingModifier::Cookie(CookieModifier::parse(value)?))
            }
            "all" => return Ok(None),
            other => match ContentType::from_name(other) {
                Some(content_type) => {
                    if value.is_some() {
                        return Err(RuleError::invalid("content-type", "takes no value"));
                    }
                    Modifier::Matching(MatchingModifier::ContentType(ContentTypeModifier::new(
                        content_type,
                        inverted,
                    )))
                }
                None => return Err(RuleError::UnknownModifier(raw.to_string())),
            },
        };

        Ok(Some(modifier))
    }
}

/// The parsed modifiers of one rule.
///
/// Matching modifiers are split into an AND group, all of which must hold,
/// and a content-type OR group, at least one of which must hold when it is
/// non-empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModifierSet {
    and_group: Vec<MatchingModifier>,
    or_group: Vec<MatchingModifier>,
    modifying: Vec<ModifyingModifier>,
}

impl ModifierSet {
    /// Parses a comma-separated modifier list.
    pub fn parse(modifiers: &str) -> Result<Self> {
        let mut set = Self::default();
        for raw in modifiers.split(',') {
            match Modifier::parse(raw)? {
                Some(Modifier::Matching(m)) if m.is_content_type() => set.or_group.push(m),
                Some(Modifier::Matching(m)) => set.and_group.push(m),
                Some(Modifier::Modifying(m)) => set.modifying.push(m),
                None => {}
            }
        }
        Ok(set)
    }

    /// Returns true if no modifiers were parsed.
    pub fn is_empty(&self) -> bool {
        self.and_group.is_empty() && self.or_group.is_empty() && self.modifying.is_empty()
    }

    /// All matching modifiers, AND group first.
    pub fn matching(&self) -> impl Iterator<Item = &MatchingModifier> {
        self.and_group.iter().chain(self.or_group.iter())
    }

    pub fn modifying(&self) -> &[ModifyingModifier] {
        &self.modifying
    }

    pub fn should_match_req(&self, req: &request::Parts) -> bool {
        self.and_group.iter().all(|m| m.should_match_req(req))
            && (self.or_group.is_empty() || self.or_group.iter().any(|m| m.should_match_req(req)))
    }

    pub fn should_match_res(&self, req: &request::Parts, res: &response::Parts) -> bool {
        self.and_group.iter().all(|m| m.should_match_res(req, res))
            && (self.or_group.is_empty()
                || self.or_group.iter().any(|m| m.should_match_res(req, res)))
    }

    /// Applies every modifying modifier. Returns true if any of them changed the request.
    pub fn modify_req(&self, req: &mut request::Parts) -> bool {
        self.modifying
            .iter()
            .fold(false, |modified, m| m.modify_req(req) | modified)
    }

    /// Applies every modifying modifier. Returns true if any of them changed the response.
    pub fn modify_res(&self, res: &mut response::Parts) -> bool {
        self.modifying
            .iter()
            .fold(false, |modified, m| m.modify_res(res) | modified)
    }
}

/// Order-independent comparison of two entry lists.
pub(crate) fn same_entries<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.contains(x)) && b.iter().all(|x| a.contains(x))
}

/// Splits a `|`-separated value list, keeping `/regex/` entries intact even
/// when they contain `|`.
pub(crate) fn split_entries(value: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut rest = value;
    loop {
        let body = rest.strip_prefix('~').unwrap_or(rest);
        let end = if body.starts_with('/') {
            let offset = rest.len() - body.len();
            body[1..].find("/|").map(|i| offset + i + 2)
        } else {
            rest.find('|')
        };
        match end {
            Some(end) => {
                entries.push(&rest[..end]);
                rest = &rest[end + 1..];
            }
            None => {
                entries.push(rest);
                return entries;
            }
        }
    }
}

/// Lowercased hostname of the request URI.
pub(crate) fn request_host(req: &request::Parts) -> Option<String> {
    req.uri.host().map(|h| h.to_ascii_lowercase())
}

/// Lowercased hostname of the `Referer` header, if it parses as a URL.
pub(crate) fn referer_host(req: &request::Parts) -> Option<String> {
    let referer = req.headers.get(http::header::REFERER)?.to_str().ok()?;
    let url = url::Url::parse(referer).ok()?;
    url.host_str().map(|h| h.to_ascii_lowercase())
}
