//! Exception (`@@`) rules.

use std::sync::Arc;

use http::{request, response};

use crate::error::Result;
use crate::modifiers::{ModifierSet, ModifyingModifier};
use crate::rule::Rule;
use crate::trie::TrieData;

/// A rule that cancels matching regular rules.
///
/// An exception with no modifiers cancels every regular rule found for the
/// same exchange. Otherwise it cancels a regular rule only when each of the
/// regular rule's matching modifiers has a structurally equal counterpart
/// on the exception, and each of the exception's modifying modifiers has
/// one on the regular rule. Comparison is over parsed values, so entry order
/// does not matter but spelling of equivalent patterns does.
#[derive(Debug, Clone)]
pub struct ExceptionRule {
    raw_rule: String,
    filter_name: Arc<str>,
    modifiers: ModifierSet,
}

impl ExceptionRule {
    pub fn new(raw_rule: impl Into<String>, filter_name: Arc<str>) -> Self {
        Self {
            raw_rule: raw_rule.into(),
            filter_name,
            modifiers: ModifierSet::default(),
        }
    }

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

    /// Returns true if this exception neutralises `rule`.
    pub fn cancels(&self, rule: &Rule) -> bool {
        if self.modifiers.is_empty() {
            return true;
        }

        let ours: Vec<_> = self.modifiers.matching().collect();
        rule.modifiers()
            .matching()
            .all(|theirs| ours.contains(&theirs))
            && covers(rule.modifiers().modifying(), self.modifiers.modifying())
    }
}

/// True if every modifier in `required` appears in `available`.
fn covers(available: &[ModifyingModifier], required: &[ModifyingModifier]) -> bool {
    required.iter().all(|m| available.contains(m))
}

impl TrieData for ExceptionRule {
    fn new(raw_rule: &str, filter_name: &Arc<str>, modifiers: ModifierSet) -> Self {
        Self {
            raw_rule: raw_rule.to_string(),
            filter_name: filter_name.clone(),
            modifiers,
        }
    }

    fn should_match_req(&self, req: &request::Parts) -> bool {
        self.modifiers.should_match_req(req)
    }

    fn should_match_res(&self, req: &request::Parts, res: &response::Parts) -> bool {
        self.modifiers.should_match_res(req, res)
    }
}
