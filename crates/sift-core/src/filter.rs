//! Filter facade: ingests filter lists and reports decisions to observers.

use std::fmt;
use std::io::BufRead;
use std::sync::Arc;

use http::{header, request, response, Response};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::Result;
use crate::network_rules::{
    block_response, redirect_response, NetworkRules, RequestVerdict, RuleKind,
};
use crate::rule::{AppliedRule, Rule};

/// Filter list name used for rules entered by the user.
pub const USER_RULES_LIST: &str = "My rules";

/// Comments (`!`), list headers (`[Adblock Plus 2.0]`) and hosts-file
/// comments (`#`, but not cosmetic `##` or `#%#`).
static RE_IGNORED_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:!|\[|#([^#%]|$))").expect("Invalid ignored line regex"));

/// Element-hiding and scriptlet rules, which have no network effect.
static RE_COSMETIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#[@$?%]{0,2}#").expect("Invalid cosmetic regex"));

/// What the filter did to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterAction {
    Block,
    Redirect { to: String },
    Modify,
}

/// A filtering decision reported to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterEvent {
    pub action: FilterAction,
    pub method: String,
    pub url: String,
    pub referer: Option<String>,
    pub rules: Vec<AppliedRule>,
}

/// Callback invoked for filter events.
pub type EventCallback = Arc<dyn Fn(&FilterEvent) + Send + Sync>;

/// Counts returned by [`Filter::add_rules`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleCounts {
    pub rules: usize,
    pub exceptions: usize,
}

/// Network filter shared by all proxy connections.
#[derive(Default)]
pub struct Filter {
    rules: NetworkRules,
    on_block: Option<EventCallback>,
    on_redirect: Option<EventCallback>,
    on_modify: Option<EventCallback>,
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("on_block", &self.on_block.is_some())
            .field("on_redirect", &self.on_redirect.is_some())
            .field("on_modify", &self.on_modify.is_some())
            .finish_non_exhaustive()
    }
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a callback for blocked requests.
    pub fn on_block<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FilterEvent) + Send + Sync + 'static,
    {
        self.on_block = Some(Arc::new(callback));
        self
    }

    /// Sets a callback for requests redirected after URL rewriting.
    pub fn on_redirect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FilterEvent) + Send + Sync + 'static,
    {
        self.on_redirect = Some(Arc::new(callback));
        self
    }

    /// Sets a callback for requests or responses modified in place.
    pub fn on_modify<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FilterEvent) + Send + Sync + 'static,
    {
        self.on_modify = Some(Arc::new(callback));
        self
    }

    /// Adds a single rule line. Returns the trie it went to and the number
    /// of entries inserted.
    pub fn add_rule(&self, line: &str, filter_name: &Arc<str>) -> Result<(RuleKind, usize)> {
        self.rules.parse_rule(line, filter_name)
    }

    /// Adds every rule in a filter list.
    ///
    /// Comments, headers, blank and cosmetic lines are skipped silently.
    /// Malformed rules are logged and skipped.
    pub fn add_rules<R: BufRead>(&self, reader: R, filter_name: &str) -> RuleCounts {
        let filter_name: Arc<str> = Arc::from(filter_name);
        let mut counts = RuleCounts::default();

        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("Stopped reading filter list {}: {}", filter_name, e);
                    break;
                }
            };
            let line = line.trim();
            if line.is_empty() || RE_IGNORED_LINE.is_match(line) || RE_COSMETIC.is_match(line) {
                continue;
            }

            match self.add_rule(line, &filter_name) {
                Ok((RuleKind::Regular, inserted)) => counts.rules += inserted,
                Ok((RuleKind::Exception, inserted)) => counts.exceptions += inserted,
                Err(e) => {
                    tracing::debug!("Skipping rule {:?} from {}: {}", line, filter_name, e);
                }
            }
        }

        tracing::info!(
            "Loaded {} rules and {} exceptions from {}",
            counts.rules,
            counts.exceptions,
            filter_name
        );
        counts
    }

    /// Adds rules entered by the user under [`USER_RULES_LIST`].
    pub fn add_user_rules<S: AsRef<str>>(&self, rules: &[S]) -> RuleCounts {
        let text = rules.iter().map(AsRef::as_ref).collect::<Vec<_>>().join("\n");
        self.add_rules(text.as_bytes(), USER_RULES_LIST)
    }

    /// Runs a request through the rules.
    ///
    /// Returns the response to send instead of contacting the origin when
    /// the request is blocked or must be redirected. Otherwise the request
    /// may have been modified in place and should be forwarded.
    pub fn handle_request(&self, req: &mut request::Parts) -> Option<Response<()>> {
        let method = req.method.to_string();
        let url = req.uri.to_string();
        let referer = referer(req);

        match self.rules.modify_req(req) {
            RequestVerdict::Allow => None,
            RequestVerdict::Block(rule) => {
                tracing::debug!("Blocked {} {} by {}", method, url, rule.raw_rule());
                self.emit(&self.on_block, FilterEvent {
                    action: FilterAction::Block,
                    method,
                    url,
                    referer,
                    rules: vec![rule.applied()],
                });
                Some(block_response(req))
            }
            RequestVerdict::Redirect { to, rules } => {
                let response = redirect_response(req, &to);
                self.emit(&self.on_redirect, FilterEvent {
                    action: FilterAction::Redirect { to },
                    method,
                    url,
                    referer,
                    rules: applied(&rules),
                });
                Some(response)
            }
            RequestVerdict::Modified(rules) => {
                self.emit(&self.on_modify, FilterEvent {
                    action: FilterAction::Modify,
                    method,
                    url,
                    referer,
                    rules: applied(&rules),
                });
                None
            }
        }
    }

    /// Applies response-phase rules in place.
    pub fn handle_response(&self, req: &request::Parts, res: &mut response::Parts) {
        let rules = self.rules.modify_res(req, res);
        if rules.is_empty() {
            return;
        }
        self.emit(&self.on_modify, FilterEvent {
            action: FilterAction::Modify,
            method: req.method.to_string(),
            url: req.uri.to_string(),
            referer: referer(req),
            rules: applied(&rules),
        });
    }

    fn emit(&self, callback: &Option<EventCallback>, event: FilterEvent) {
        if let Some(callback) = callback {
            callback(&event);
        }
    }
}

fn referer(req: &request::Parts) -> Option<String> {
    req.headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn applied(rules: &[Arc<Rule>]) -> Vec<AppliedRule> {
    rules.iter().map(|r| r.applied()).collect()
}
