//! Token trie holding filter rules.
//!
//! Rules are inserted under the tokens of their address part and looked up
//! by walking the tokens of the request URL. Besides the default root, the
//! trie has dedicated entry points for domain-anchored (`||`), address-anchored
//! (`|`) and modifier-only (`$`) rules, and a flat map for hosts-file entries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use http::{request, response};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;

use crate::error::{Result, RuleError};
use crate::modifiers::ModifierSet;
use crate::tokenize::{is_separator_token, tokenize};

static RE_HOSTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:0\.0\.0\.0|127\.0\.0\.1)\s+(.+)$").expect("Invalid hosts regex")
});
static RE_IGNORED_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:0\.0\.0\.0|broadcasthost|local|localhost(?:\.localdomain)?|ip6-\w+)$")
        .expect("Invalid ignored host regex")
});
static RE_DOMAIN_ANCHOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\|\|([^$]+)(?:\$(.+))?$").expect("Invalid domain regex"));
static RE_ADDRESS_ANCHOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\|([^|$][^$]*)(?:\$(.+))?$").expect("Invalid address regex"));
static RE_ADDRESS_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^$]+)(?:\$(.+))?$").expect("Invalid address part regex"));
static RE_GENERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$(.+)$").expect("Invalid generic regex"));

/// A value stored in the trie.
pub trait TrieData: Send + Sync + Sized + 'static {
    /// Builds the value for a parsed rule.
    fn new(raw_rule: &str, filter_name: &Arc<str>, modifiers: ModifierSet) -> Self;

    fn should_match_req(&self, req: &request::Parts) -> bool;

    fn should_match_res(&self, req: &request::Parts, res: &response::Parts) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NodeKind {
    AddressRoot,
    Domain,
    Generic,
    Wildcard,
    Separator,
}

/// Where a rule pattern is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    Root,
    Special(NodeKind),
}

struct Children<T> {
    exact: HashMap<String, Arc<Node<T>>>,
    special: HashMap<NodeKind, Arc<Node<T>>>,
}

impl<T> Default for Children<T> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            special: HashMap::new(),
        }
    }
}

struct Node<T> {
    children: RwLock<Children<T>>,
    rules: RwLock<Vec<Arc<T>>>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: RwLock::new(Children::default()),
            rules: RwLock::new(Vec::new()),
        }
    }
}

impl<T: TrieData> Node<T> {
    fn exact_child(&self, token: &str) -> Option<Arc<Node<T>>> {
        self.children.read().exact.get(token).cloned()
    }

    fn special_child(&self, kind: NodeKind) -> Option<Arc<Node<T>>> {
        self.children.read().special.get(&kind).cloned()
    }

    fn exact_child_or_insert(&self, token: &str) -> Arc<Node<T>> {
        if let Some(child) = self.exact_child(token) {
            return child;
        }
        self.children
            .write()
            .exact
            .entry(token.to_string())
            .or_default()
            .clone()
    }

    fn special_child_or_insert(&self, kind: NodeKind) -> Arc<Node<T>> {
        if let Some(child) = self.special_child(kind) {
            return child;
        }
        self.children
            .write()
            .special
            .entry(kind)
            .or_default()
            .clone()
    }

    /// Walks `tokens` from this node, collecting rules whose own modifiers
    /// accept the exchange. When `anchored_end` is set, rules are only taken
    /// from nodes reached with no tokens left.
    fn traverse(
        &self,
        tokens: &[&str],
        anchored_end: bool,
        accepts: &dyn Fn(&T) -> bool,
        out: &mut Vec<Arc<T>>,
    ) {
        if !anchored_end || tokens.is_empty() {
            out.extend(self.rules.read().iter().filter(|r| accepts(r)).cloned());
        }

        let Some((first, rest)) = tokens.split_first() else {
            // End of input satisfies a separator.
            if let Some(separator) = self.special_child(NodeKind::Separator) {
                separator.traverse(tokens, anchored_end, accepts, out);
            }
            return;
        };

        if is_separator_token(first) {
            if let Some(separator) = self.special_child(NodeKind::Separator) {
                separator.traverse(rest, anchored_end, accepts, out);
            }
        }
        if let Some(wildcard) = self.special_child(NodeKind::Wildcard) {
            wildcard.traverse(rest, anchored_end, accepts, out);
        }
        if let Some(child) = self.exact_child(first) {
            child.traverse(rest, anchored_end, accepts, out);
        }
    }
}

/// Concurrency-safe rule trie.
pub struct RuleTrie<T> {
    root: Node<T>,
    hosts: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: TrieData> Default for RuleTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TrieData> RuleTrie<T> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
            hosts: RwLock::new(HashMap::new()),
        }
    }

    /// Parses `pattern` and inserts the resulting rule.
    ///
    /// `pattern` is the rule text without any `@@` prefix; `raw_rule` is the
    /// original line and is kept for reporting. Returns the number of
    /// entries inserted, which is zero for hosts lines naming only
    /// sinkhole hosts.
    pub fn add_rule(&self, pattern: &str, raw_rule: &str, filter_name: &Arc<str>) -> Result<usize> {
        if let Some(caps) = RE_HOSTS.captures(pattern) {
            return Ok(self.add_hosts(&caps[1], raw_rule, filter_name));
        }

        let (anchor, address, modifiers) = if let Some(caps) = RE_DOMAIN_ANCHOR.captures(pattern) {
            (Anchor::Special(NodeKind::Domain), caps.get(1), caps.get(2))
        } else if let Some(caps) = RE_ADDRESS_ANCHOR.captures(pattern) {
            (Anchor::Special(NodeKind::AddressRoot), caps.get(1), caps.get(2))
        } else if let Some(caps) = RE_ADDRESS_PART.captures(pattern) {
            (Anchor::Root, caps.get(1), caps.get(2))
        } else if let Some(caps) = RE_GENERIC.captures(pattern) {
            (Anchor::Special(NodeKind::Generic), None, caps.get(1))
        } else {
            return Err(RuleError::UnknownFormat);
        };

        let modifiers = match modifiers {
            Some(m) => ModifierSet::parse(m.as_str())?,
            None => ModifierSet::default(),
        };
        let rule = Arc::new(T::new(raw_rule, filter_name, modifiers));

        let mut node = match anchor {
            Anchor::Root => None,
            Anchor::Special(kind) => Some(self.root.special_child_or_insert(kind)),
        };
        let tokens = address.map(|a| tokenize(a.as_str())).unwrap_or_default();
        for token in tokens {
            let parent = node.as_deref().unwrap_or(&self.root);
            node = Some(match token {
                "^" => parent.special_child_or_insert(NodeKind::Separator),
                "*" => parent.special_child_or_insert(NodeKind::Wildcard),
                literal => parent.exact_child_or_insert(literal),
            });
        }

        node.as_deref().unwrap_or(&self.root).rules.write().push(rule);
        Ok(1)
    }

    fn add_hosts(&self, hosts: &str, raw_rule: &str, filter_name: &Arc<str>) -> usize {
        let hosts = hosts.split('#').next().unwrap_or_default();
        let mut map = self.hosts.write();
        let mut added = 0;
        for host in hosts.split_whitespace() {
            if RE_IGNORED_HOST.is_match(host) {
                continue;
            }
            map.insert(
                host.to_ascii_lowercase(),
                Arc::new(T::new(raw_rule, filter_name, ModifierSet::default())),
            );
            added += 1;
        }
        added
    }

    /// Returns every rule that applies to the request.
    pub fn find_matching_rules_req(&self, req: &request::Parts) -> Vec<Arc<T>> {
        self.find(req, &|rule: &T| rule.should_match_req(req))
    }

    /// Returns every rule that applies to the response of `req`.
    pub fn find_matching_rules_res(&self, req: &request::Parts, res: &response::Parts) -> Vec<Arc<T>> {
        self.find(req, &|rule: &T| rule.should_match_res(req, res))
    }

    fn find(&self, req: &request::Parts, accepts: &dyn Fn(&T) -> bool) -> Vec<Arc<T>> {
        let mut out = Vec::new();
        let Some(host) = req.uri.host().map(|h| h.to_ascii_lowercase()) else {
            return out;
        };

        if let Some(rule) = self.hosts.read().get(&host) {
            if accepts(rule) {
                out.push(rule.clone());
            }
        }

        if let Some(generic) = self.root.special_child(NodeKind::Generic) {
            out.extend(generic.rules.read().iter().filter(|r| accepts(r)).cloned());
        }

        let scheme = req.uri.scheme_str().unwrap_or("http");
        let path_and_query = req.uri.path_and_query().map_or("/", |pq| pq.as_str());
        let url = format!("{scheme}://{host}{path_and_query}");
        let tokens = tokenize(&url);

        if let Some(address_root) = self.root.special_child(NodeKind::AddressRoot) {
            address_root.traverse(&tokens, true, accepts, &mut out);
        }

        // Host tokens start after the scheme and `://`.
        let host_start = 2;
        let host_end = host_start + tokenize(&host).len();
        let domain_root = self.root.special_child(NodeKind::Domain);

        for i in 0..tokens.len() {
            let label_start = i == host_start || (i > host_start && i < host_end && tokens[i - 1] == ".");
            if label_start {
                if let Some(domain_root) = &domain_root {
                    domain_root.traverse(&tokens[i..], false, accepts, &mut out);
                }
            }
            self.root.traverse(&tokens[i..], false, accepts, &mut out);
        }

        dedup(out)
    }
}

/// Drops repeated entries reached through more than one path, keeping
/// first-seen order.
fn dedup<T>(rules: Vec<Arc<T>>) -> Vec<Arc<T>> {
    let mut seen = HashSet::new();
    rules
        .into_iter()
        .filter(|r| seen.insert(Arc::as_ptr(r) as usize))
        .collect()
}
