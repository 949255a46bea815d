//! `/regex/` and `/regex/i` modifier values.

use std::fmt;

use regex::Regex;

use crate::error::Result;

/// A compiled regex taken from a modifier value.
///
/// Two patterns are equal when their source text is equal.
#[derive(Clone)]
pub struct RegexValue(Regex);

impl RegexValue {
    /// Parses `value` if it is written as `/.../` or `/.../i`.
    ///
    /// Returns `Ok(None)` when the value is not in regex form.
    pub fn parse(value: &str) -> Result<Option<Self>> {
        let Some(inner) = value.strip_prefix('/') else {
            return Ok(None);
        };
        let (source, case_insensitive) = if let Some(source) = inner.strip_suffix("/i") {
            (source, true)
        } else if let Some(source) = inner.strip_suffix('/') {
            (source, false)
        } else {
            return Ok(None);
        };
        if source.is_empty() {
            return Ok(None);
        }

        let regex = if case_insensitive {
            Regex::new(&format!("(?i){source}"))?
        } else {
            Regex::new(source)?
        };
        Ok(Some(Self(regex)))
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.0.is_match(haystack)
    }
}

impl PartialEq for RegexValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl fmt::Debug for RegexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.0.as_str())
    }
}
