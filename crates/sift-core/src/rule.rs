//! Regular (non-exception) filter rules.

use std::sync::Arc;

use http::{request, response};
use serde::Serialize;

use crate::error::Result;
use crate::modifiers::ModifierSet;
use crate::trie::TrieData;

/// A blocking or modifying rule from a filter list.
#[derive(Debug, Clone)]
pub struct Rule {
    raw_rule: String,
    filter_name: Arc<str>,
    modifiers: ModifierSet,
}

impl Rule {
    pub fn new(raw_rule: impl Into<String>, filter_name: Arc<str>) -> Self {
        Self {
            raw_rule: raw_rule.into(),
            filter_name,
            modifiers: ModifierSet::default(),
        }
    }

    /// Replaces the rule's modifiers with the parsed `modifiers` list.
    pub fn parse_modifiers(&mut self, modifiers: &str) -> Result<()> {
        self.modifiers = ModifierSet::parse(modifiers)?;
        Ok(())
    }

    pub fn raw_rule(&self) -> &str {
        &self.raw_rule
    }

    pub fn filter_name(&self) -> &str {
        &self.filter_name
    }

    pub fn modifiers(&self) -> &ModifierSet {
        &self.modifiers
    }

    /// Returns true if the rule's matching modifiers accept the request.
    pub fn should_match_req(&self, req: &request::Parts) -> bool {
        self.modifiers.should_match_req(req)
    }

    pub fn should_match_res(&self, req: &request::Parts, res: &response::Parts) -> bool {
        self.modifiers.should_match_res(req, res)
    }

    /// Rules without modifying modifiers block; all others only rewrite.
    pub fn should_block_req(&self) -> bool {
        self.modifiers.modifying().is_empty()
    }

    pub fn modify_req(&self, req: &mut request::Parts) -> bool {
        self.modifiers.modify_req(req)
    }

    pub fn modify_res(&self, res: &mut response::Parts) -> bool {
        self.modifiers.modify_res(res)
    }

    /// Snapshot of the rule for event reporting.
    pub fn applied(&self) -> AppliedRule {
        AppliedRule {
            raw_rule: self.raw_rule.clone(),
            filter_name: self.filter_name.to_string(),
        }
    }
}

impl TrieData for Rule {
    fn new(raw_rule: &str, filter_name: &Arc<str>, modifiers: ModifierSet) -> Self {
        Self {
            raw_rule: raw_rule.to_string(),
            filter_name: filter_name.clone(),
            modifiers,
        }
    }

    fn should_match_req(&self, req: &request::Parts) -> bool {
        Rule::should_match_req(self, req)
    }

    fn should_match_res(&self, req: &request::Parts, res: &response::Parts) -> bool {
        Rule::should_match_res(self, req, res)
    }
}

/// A rule that was applied to an exchange, as reported to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedRule {
    pub raw_rule: String,
    pub filter_name: String,
}
