//! Splits URLs and rule patterns into matching tokens.
//!
//! Delimiters are kept as their own tokens so that concatenating the
//! output reproduces the input exactly. No normalization is applied.

/// Single-character delimiters. `://` is matched before these.
const DELIMITERS: &[u8] = b".-_/?=&:^*";

const SCHEME_SEPARATOR: &[u8] = b"://";

/// Splits `input` into literal runs and delimiter tokens.
///
/// # Examples
///
/// ```
/// use sift_core::tokenize;
///
/// assert_eq!(
///     tokenize("http://ads.example.com/"),
///     vec!["http", "://", "ads", ".", "example", ".", "com", "/"]
/// );
/// ```
pub fn tokenize(input: &str) -> Vec<&str> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let delimiter_len = if bytes[i..].starts_with(SCHEME_SEPARATOR) {
            SCHEME_SEPARATOR.len()
        } else if DELIMITERS.contains(&bytes[i]) {
            1
        } else {
            i += 1;
            continue;
        };

        if start < i {
            tokens.push(&input[start..i]);
        }
        tokens.push(&input[i..i + delimiter_len]);
        i += delimiter_len;
        start = i;
    }

    if start < input.len() {
        tokens.push(&input[start..]);
    }

    tokens
}

/// Returns true if `token` can satisfy a `^` separator in a rule.
///
/// Letters, digits and `_ - . %` are not separators; anything else is.
pub fn is_separator_token(token: &str) -> bool {
    token
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '%')))
}
