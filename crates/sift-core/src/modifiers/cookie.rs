//! `$cookie` modifier.

use http::{header, request, response, HeaderValue};

use super::pattern::RegexValue;
use crate::error::{Result, RuleError};

#[derive(Debug, Clone, PartialEq)]
enum CookieMatch {
    All,
    Name(String),
    Regex(RegexValue),
}

impl CookieMatch {
    fn matches(&self, name: &str) -> bool {
        match self {
            CookieMatch::All => true,
            CookieMatch::Name(expected) => name == expected,
            CookieMatch::Regex(re) => re.is_match(name),
        }
    }
}

/// Strips cookies from `Cookie` request headers and `Set-Cookie` response headers.
///
/// Forms: `cookie` (all cookies), `cookie=name` and `cookie=/regex/`.
#[derive(Debug, Clone, PartialEq)]
pub struct CookieModifier {
    cookie: CookieMatch,
}

impl CookieModifier {
    pub(crate) fn parse(value: Option<&str>) -> Result<Self> {
        let cookie = match value {
            None | Some("") => CookieMatch::All,
            Some(value) => match RegexValue::parse(value)? {
                Some(re) => CookieMatch::Regex(re),
                None if value.contains([';', ' ', '=']) => {
                    return Err(RuleError::invalid("cookie", "bad cookie name"));
                }
                None => CookieMatch::Name(value.to_string()),
            },
        };
        Ok(Self { cookie })
    }

    pub(crate) fn modify_req(&self, req: &mut request::Parts) -> bool {
        let mut modified = false;
        let mut kept = Vec::new();
        for value in req.headers.get_all(header::COOKIE) {
            let Ok(value) = value.to_str() else {
                return false;
            };
            for pair in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
                if self.cookie.matches(cookie_name(pair)) {
                    modified = true;
                } else {
                    kept.push(pair.to_string());
                }
            }
        }
        if !modified {
            return false;
        }

        req.headers.remove(header::COOKIE);
        if !kept.is_empty() {
            match HeaderValue::from_str(&kept.join("; ")) {
                Ok(value) => {
                    req.headers.insert(header::COOKIE, value);
                }
                Err(_) => return false,
            }
        }
        true
    }

    pub(crate) fn modify_res(&self, res: &mut response::Parts) -> bool {
        let values: Vec<HeaderValue> = res.headers.get_all(header::SET_COOKIE).iter().cloned().collect();
        let kept: Vec<HeaderValue> = values
            .iter()
            .filter(|v| {
                v.to_str()
                    .map(|s| !self.cookie.matches(cookie_name(s)))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if kept.len() == values.len() {
            return false;
        }

        res.headers.remove(header::SET_COOKIE);
        for value in kept {
            res.headers.append(header::SET_COOKIE, value);
        }
        true
    }
}

fn cookie_name(pair: &str) -> &str {
    pair.split_once('=').map_or(pair, |(name, _)| name).trim()
}
