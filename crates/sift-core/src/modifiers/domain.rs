//! `$domain=` modifier.

use http::request;

use super::pattern::RegexValue;
use super::{referer_host, request_host, same_entries, split_entries};
use crate::error::{Result, RuleError};

#[derive(Debug, Clone, PartialEq)]
enum DomainEntry {
    /// Matches the domain and all of its subdomains.
    Suffix(String),
    /// `example.*`, stored as `example.`.
    Tld(String),
    Regex(RegexValue),
}

impl DomainEntry {
    fn matches(&self, host: &str) -> bool {
        match self {
            DomainEntry::Suffix(domain) => {
                host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }
            DomainEntry::Tld(prefix) => {
                host.starts_with(prefix.as_str()) || host.contains(&format!(".{prefix}"))
            }
            DomainEntry::Regex(re) => re.is_match(host),
        }
    }
}

/// Restricts a rule to requests originating from (or, inverted, not from)
/// the listed domains.
///
/// The origin is the `Referer` hostname, falling back to the request
/// hostname when no `Referer` is sent.
#[derive(Debug, Clone)]
pub struct DomainModifier {
    entries: Vec<DomainEntry>,
    inverted: bool,
}

impl DomainModifier {
    pub(crate) fn parse(value: &str) -> Result<Self> {
        let mut entries = Vec::new();
        let mut inverted = None;

        for raw in split_entries(value) {
            let (entry_inverted, raw) = match raw.strip_prefix('~') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            if raw.is_empty() {
                return Err(RuleError::invalid("domain", "empty entry"));
            }
            if *inverted.get_or_insert(entry_inverted) != entry_inverted {
                return Err(RuleError::MixedInversion("domain"));
            }

            let entry = if let Some(re) = RegexValue::parse(raw)? {
                DomainEntry::Regex(re)
            } else if let Some(prefix) = raw.strip_suffix('*') {
                DomainEntry::Tld(prefix.to_ascii_lowercase())
            } else {
                DomainEntry::Suffix(raw.to_ascii_lowercase())
            };
            entries.push(entry);
        }

        Ok(Self {
            entries,
            inverted: inverted.unwrap_or(false),
        })
    }

    pub(crate) fn should_match_req(&self, req: &request::Parts) -> bool {
        let Some(host) = referer_host(req).or_else(|| request_host(req)) else {
            return false;
        };
        self.entries.iter().any(|e| e.matches(&host)) != self.inverted
    }
}

impl PartialEq for DomainModifier {
    fn eq(&self, other: &Self) -> bool {
        self.inverted == other.inverted && same_entries(&self.entries, &other.entries)
    }
}
