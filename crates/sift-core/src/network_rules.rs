//! Combines the regular and exception tries and applies them to traffic.

use std::sync::Arc;

use http::{header, request, response, Response, StatusCode};

use crate::error::Result;
use crate::exception::ExceptionRule;
use crate::rule::Rule;
use crate::trie::RuleTrie;

/// Which trie a parsed line was added to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Regular,
    Exception,
}

/// Outcome of running a request through the rules.
#[derive(Debug, Clone)]
pub enum RequestVerdict {
    /// No rule applied.
    Allow,
    /// The first surviving rule without modifying modifiers.
    Block(Arc<Rule>),
    /// Modifying rules changed the URL; the client should be sent to `to`.
    Redirect { to: String, rules: Vec<Arc<Rule>> },
    /// Modifying rules changed headers in place.
    Modified(Vec<Arc<Rule>>),
}

/// Network-level filter rules.
#[derive(Default)]
pub struct NetworkRules {
    regular: RuleTrie<Rule>,
    exceptions: RuleTrie<ExceptionRule>,
}

impl NetworkRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one rule line to the exception or regular trie.
    ///
    /// Returns the trie it went to and the number of entries inserted. A
    /// hosts line yields one entry per host and none for sinkhole names
    /// such as `localhost`.
    pub fn parse_rule(&self, raw_rule: &str, filter_name: &Arc<str>) -> Result<(RuleKind, usize)> {
        match raw_rule.strip_prefix("@@") {
            Some(pattern) => {
                let inserted = self.exceptions.add_rule(pattern, raw_rule, filter_name)?;
                Ok((RuleKind::Exception, inserted))
            }
            None => {
                let inserted = self.regular.add_rule(raw_rule, raw_rule, filter_name)?;
                Ok((RuleKind::Regular, inserted))
            }
        }
    }

    /// Matches the request, applies exception cancellation and then either
    /// blocks or applies modifying rules in place.
    pub fn modify_req(&self, req: &mut request::Parts) -> RequestVerdict {
        let regular = self.regular.find_matching_rules_req(req);
        if regular.is_empty() {
            return RequestVerdict::Allow;
        }
        let exceptions = self.exceptions.find_matching_rules_req(req);
        let survivors = cancel(regular, &exceptions);

        if let Some(blocking) = survivors.iter().find(|r| r.should_block_req()) {
            return RequestVerdict::Block(blocking.clone());
        }

        let original_uri = req.uri.clone();
        let applied: Vec<Arc<Rule>> = survivors
            .into_iter()
            .filter(|rule| rule.modify_req(req))
            .collect();

        if applied.is_empty() {
            RequestVerdict::Allow
        } else if req.uri != original_uri {
            RequestVerdict::Redirect {
                to: req.uri.to_string(),
                rules: applied,
            }
        } else {
            RequestVerdict::Modified(applied)
        }
    }

    /// Applies response-phase modifying rules. Responses are never blocked.
    pub fn modify_res(&self, req: &request::Parts, res: &mut response::Parts) -> Vec<Arc<Rule>> {
        let regular = self.regular.find_matching_rules_res(req, res);
        if regular.is_empty() {
            return Vec::new();
        }
        let exceptions = self.exceptions.find_matching_rules_res(req, res);

        cancel(regular, &exceptions)
            .into_iter()
            .filter(|rule| rule.modify_res(res))
            .collect()
    }
}

fn cancel(regular: Vec<Arc<Rule>>, exceptions: &[Arc<ExceptionRule>]) -> Vec<Arc<Rule>> {
    regular
        .into_iter()
        .filter(|rule| !exceptions.iter().any(|e| e.cancels(rule)))
        .collect()
}

/// Builds the empty 403 returned for blocked requests.
pub fn block_response(req: &request::Parts) -> Response<()> {
    let mut res = Response::new(());
    *res.status_mut() = StatusCode::FORBIDDEN;
    *res.version_mut() = req.version;
    res.headers_mut()
        .insert(header::CONTENT_LENGTH, header::HeaderValue::from_static("0"));
    res
}

/// Builds the 307 sent when modifiers rewrote the request URL.
pub fn redirect_response(req: &request::Parts, to: &str) -> Response<()> {
    let mut res = Response::new(());
    *res.status_mut() = StatusCode::TEMPORARY_REDIRECT;
    *res.version_mut() = req.version;
    if let Ok(location) = header::HeaderValue::from_str(to) {
        res.headers_mut().insert(header::LOCATION, location);
    }
    res.headers_mut()
        .insert(header::CONTENT_LENGTH, header::HeaderValue::from_static("0"));
    res
}
