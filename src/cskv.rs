//! Comma-separated `key=value` configuration strings
//!
//! `"timeout=5000, verbose=1"` style strings configure options, credentials
//! and certificates. Keys and values are trimmed of ASCII whitespace; an entry
//! without `=` rejects the whole string.

use crate::error::ConfigError;
use std::str::FromStr;

/// Trim ASCII whitespace (space, tab, CR, LF, VT, FF) from both ends.
#[must_use]
pub fn trim(value: &str) -> &str {
    value.trim_matches(|c: char| matches!(c, ' ' | '\t' | '\r' | '\n' | '\x0b' | '\x0c'))
}

/// Run `handler` on every entry of `input`, left to right.
///
/// Parsing stops at the first entry without `=` or the first error the
/// handler returns. A single trailing comma is tolerated.
pub fn parse<F>(input: &str, mut handler: F) -> Result<(), ConfigError>
where
    F: FnMut(&str, &str) -> Result<(), ConfigError>,
{
    let input = input.strip_suffix(',').unwrap_or(input);
    if input.is_empty() {
        return Ok(());
    }

    for entry in input.split(',') {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(ConfigError::MissingSeparator(entry.to_string()));
        };
        handler(trim(key), trim(value))?;
    }
    Ok(())
}

/// Parse an integer made only of ASCII digits with an optional leading `-`.
///
/// Unlike `str::parse`, a leading `+` is rejected, and so is surrounding
/// whitespace.
pub fn parse_number<T: FromStr>(value: &str) -> Option<T> {
    let digits = value.strip_prefix('-').unwrap_or(value);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Parse `1/0`, `true/false`, `yes/no` or `on/off`, ignoring ASCII case.
pub fn parse_bool(value: &str) -> Option<bool> {
    const TRUE: [&str; 4] = ["1", "true", "yes", "on"];
    const FALSE: [&str; 4] = ["0", "false", "no", "off"];

    if TRUE.iter().any(|t| t.eq_ignore_ascii_case(value)) {
        Some(true)
    } else if FALSE.iter().any(|f| f.eq_ignore_ascii_case(value)) {
        Some(false)
    } else {
        None
    }
}

pub(crate) fn number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    parse_number(value).ok_or_else(|| ConfigError::invalid(key, value))
}

pub(crate) fn boolean(key: &str, value: &str) -> Result<bool, ConfigError> {
    parse_bool(value).ok_or_else(|| ConfigError::invalid(key, value))
}
