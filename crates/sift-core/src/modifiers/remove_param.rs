//! `$removeparam` modifier.

use std::borrow::Cow;

use http::{request, uri::PathAndQuery, Uri};

use super::pattern::RegexValue;
use crate::error::{Result, RuleError};

#[derive(Debug, Clone, PartialEq)]
enum ParamMatch {
    /// Bare `$removeparam`: strips the whole query.
    All,
    Exact(String),
    ExactInverse(String),
    /// Matched against `name=value`.
    Regex(RegexValue),
    RegexInverse(RegexValue),
}

/// Removes query parameters from request URLs.
///
/// Forms: `removeparam`, `removeparam=name`, `removeparam=~name`,
/// `removeparam=/regex/` and `removeparam=~/regex/`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoveParamModifier {
    param: ParamMatch,
}

impl RemoveParamModifier {
    pub(crate) fn parse(value: Option<&str>) -> Result<Self> {
        let param = match value {
            None | Some("") => ParamMatch::All,
            Some(value) => {
                let (inverse, value) = match value.strip_prefix('~') {
                    Some(rest) => (true, rest),
                    None => (false, value),
                };
                if value.is_empty() {
                    return Err(RuleError::invalid("removeparam", "empty parameter name"));
                }
                match (RegexValue::parse(value)?, inverse) {
                    (Some(re), false) => ParamMatch::Regex(re),
                    (Some(re), true) => ParamMatch::RegexInverse(re),
                    (None, false) => ParamMatch::Exact(value.to_string()),
                    (None, true) => ParamMatch::ExactInverse(value.to_string()),
                }
            }
        };
        Ok(Self { param })
    }

    fn should_remove(&self, segment: &str) -> bool {
        let (name, value) = decode_param(segment);
        match &self.param {
            ParamMatch::All => true,
            ParamMatch::Exact(expected) => name == expected.as_str(),
            ParamMatch::ExactInverse(kept) => name != kept.as_str(),
            ParamMatch::Regex(re) => re.is_match(&format!("{name}={value}")),
            ParamMatch::RegexInverse(re) => !re.is_match(&format!("{name}={value}")),
        }
    }

    /// Strips matching parameters from the request URI, keeping the rest
    /// in their original order and encoding.
    pub(crate) fn modify_req(&self, req: &mut request::Parts) -> bool {
        let Some(query) = req.uri.query() else {
            return false;
        };

        let segments: Vec<&str> = query.split('&').collect();
        let kept: Vec<&str> = segments
            .iter()
            .copied()
            .filter(|segment| !self.should_remove(segment))
            .collect();
        if kept.len() == segments.len() {
            return false;
        }

        match with_query(&req.uri, &kept.join("&")) {
            Some(uri) => {
                req.uri = uri;
                true
            }
            None => false,
        }
    }
}

fn decode_param(segment: &str) -> (Cow<'_, str>, Cow<'_, str>) {
    url::form_urlencoded::parse(segment.as_bytes())
        .next()
        .unwrap_or((Cow::Borrowed(""), Cow::Borrowed("")))
}

/// Rebuilds `uri` with a new query. An empty query drops the `?`.
fn with_query(uri: &Uri, query: &str) -> Option<Uri> {
    let path_and_query = if query.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{}", uri.path(), query)
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse::<PathAndQuery>().ok()?);
    Uri::from_parts(parts).ok()
}
