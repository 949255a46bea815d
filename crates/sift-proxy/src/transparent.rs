//! Hosts that are tunneled without interception.

use std::collections::HashSet;

use parking_lot::RwLock;

/// Hostnames whose CONNECT tunnels are relayed opaquely.
///
/// A host matches if it or any parent domain is in the set. The set is
/// seeded from configuration and grows when TLS interception fails for a
/// host; entries are never removed for the life of the proxy.
#[derive(Debug, Default)]
pub struct TransparentHosts {
    hosts: RwLock<HashSet<String>>,
}

impl TransparentHosts {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: RwLock::new(
                hosts
                    .into_iter()
                    .map(|h| normalize(h.as_ref()))
                    .filter(|h| !h.is_empty())
                    .collect(),
            ),
        }
    }

    /// Returns true if `host` or one of its parent domains is transparent.
    pub fn contains(&self, host: &str) -> bool {
        let host = normalize(host);
        let hosts = self.hosts.read();
        let mut candidate = host.as_str();
        loop {
            if hosts.contains(candidate) {
                return true;
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return false,
            }
        }
    }

    /// Marks `host` as transparent. Returns true if it was not already present.
    pub fn add(&self, host: &str) -> bool {
        let added = self.hosts.write().insert(normalize(host));
        if added {
            tracing::warn!("Tunneling {} without interception from now on", crate::redacted(host));
        }
        added
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_exact_and_subdomains() {
        let hosts = TransparentHosts::new(["apple.com"]);
        assert!(hosts.contains("apple.com"));
        assert!(hosts.contains("api.push.apple.com"));
        assert!(!hosts.contains("pineapple.com"));
        assert!(!hosts.contains("com"));
    }

    #[test]
    fn case_and_trailing_dot_are_ignored() {
        let hosts = TransparentHosts::new(["Bank.Example."]);
        assert!(hosts.contains("www.bank.example"));
        assert!(hosts.contains("BANK.EXAMPLE."));
    }

    #[test]
    fn add_is_idempotent() {
        let hosts = TransparentHosts::default();
        assert!(hosts.is_empty());
        assert!(hosts.add("pinned.example"));
        assert!(!hosts.add("pinned.example"));
        assert_eq!(hosts.len(), 1);
        assert!(hosts.contains("pinned.example"));
    }
}
