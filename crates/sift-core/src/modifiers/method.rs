//! `$method=` modifier.

use http::request;

use super::{same_entries, split_entries};
use crate::error::{Result, RuleError};

/// Restricts a rule to the listed HTTP methods, or to all but them when inverted.
#[derive(Debug, Clone)]
pub struct MethodModifier {
    methods: Vec<String>,
    inverted: bool,
}

impl MethodModifier {
    pub(crate) fn parse(value: &str) -> Result<Self> {
        let mut methods = Vec::new();
        let mut inverted = None;

        for raw in split_entries(value) {
            let (entry_inverted, method) = match raw.strip_prefix('~') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(RuleError::invalid("method", format!("bad method {raw:?}")));
            }
            if *inverted.get_or_insert(entry_inverted) != entry_inverted {
                return Err(RuleError::MixedInversion("method"));
            }
            methods.push(method.to_ascii_uppercase());
        }

        Ok(Self {
            methods,
            inverted: inverted.unwrap_or(false),
        })
    }

    pub(crate) fn should_match_req(&self, req: &request::Parts) -> bool {
        let method = req.method.as_str();
        self.methods.iter().any(|m| m == method) != self.inverted
    }
}

impl PartialEq for MethodModifier {
    fn eq(&self, other: &Self) -> bool {
        self.inverted == other.inverted && same_entries(&self.methods, &other.methods)
    }
}
