//! `$header=` modifier.

use http::{response, HeaderName};

use super::pattern::RegexValue;
use crate::error::{Result, RuleError};

#[derive(Debug, Clone, PartialEq)]
enum ValueMatch {
    Any,
    Exact(String),
    Regex(RegexValue),
}

/// Matches responses carrying a header, optionally with a given value.
///
/// Syntax: `header=name`, `header=name:value` or `header=name:/regex/`.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderModifier {
    name: HeaderName,
    value: ValueMatch,
}

impl HeaderModifier {
    pub(crate) fn parse(value: &str) -> Result<Self> {
        let (name, expected) = match value.split_once(':') {
            Some((name, expected)) => (name, Some(expected)),
            None => (value, None),
        };
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| RuleError::invalid("header", e.to_string()))?;

        let value = match expected {
            None => ValueMatch::Any,
            Some("") => return Err(RuleError::invalid("header", "empty value")),
            Some(expected) => match RegexValue::parse(expected)? {
                Some(re) => ValueMatch::Regex(re),
                None => ValueMatch::Exact(expected.to_string()),
            },
        };

        Ok(Self { name, value })
    }

    pub(crate) fn should_match_res(&self, res: &response::Parts) -> bool {
        res.headers.get_all(&self.name).iter().any(|v| match &self.value {
            ValueMatch::Any => true,
            ValueMatch::Exact(expected) => v.as_bytes() == expected.as_bytes(),
            ValueMatch::Regex(re) => v.to_str().is_ok_and(|v| re.is_match(v)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modifiers::test_support::res;

    #[test]
    fn presence() {
        let m = HeaderModifier::parse("X-Ad-Server").unwrap();
        assert!(m.should_match_res(&res(&[("x-ad-server", "1")])));
        assert!(!m.should_match_res(&res(&[("server", "nginx")])));
    }

    #[test]
    fn exact_value() {
        let m = HeaderModifier::parse("server:adsrv").unwrap();
        assert!(m.should_match_res(&res(&[("server", "adsrv")])));
        assert!(!m.should_match_res(&res(&[("server", "adsrv2")])));
    }

    #[test]
    fn regex_value() {
        let m = HeaderModifier::parse("content-type:/^image/").unwrap();
        assert!(m.should_match_res(&res(&[("content-type", "image/gif")])));
        assert!(!m.should_match_res(&res(&[("content-type", "text/html")])));
    }

    #[test]
    fn invalid_values() {
        assert!(HeaderModifier::parse("bad header").is_err());
        assert!(HeaderModifier::parse("server:").is_err());
    }
}
