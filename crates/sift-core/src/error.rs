//! Error types for rule parsing.

use thiserror::Error;

/// Errors that can occur while parsing a filter rule.
#[derive(Debug, Error)]
pub enum RuleError {
    /// The rule text does not match any known rule shape.
    #[error("unknown rule format")]
    UnknownFormat,

    /// A modifier list contained an empty entry.
    #[error("empty modifier")]
    EmptyModifier,

    /// The modifier name is not recognised.
    #[error("unknown modifier: {0}")]
    UnknownModifier(String),

    /// A recognised modifier has a malformed value.
    #[error("invalid {kind} modifier: {reason}")]
    InvalidModifier {
        kind: &'static str,
        reason: String,
    },

    /// A modifier mixes inverted and non-inverted entries.
    #[error("{0} modifier mixes inverted and non-inverted entries")]
    MixedInversion(&'static str),

    /// A `/regex/` value failed to compile.
    #[error("invalid regex: {0}")]
    InvalidRegex(#[from] regex::Error),

    /// A `removeheader` rule names a header that must never be stripped.
    #[error("header {0} is forbidden from removal")]
    ForbiddenHeader(String),
}

impl RuleError {
    pub(crate) fn invalid(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidModifier {
            kind,
            reason: reason.into(),
        }
    }
}

/// Result type for rule parsing.
pub type Result<T> = std::result::Result<T, RuleError>;
