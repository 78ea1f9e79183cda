//! Query and form parameter encoding
//!
//! URLs themselves are handed to libcurl untouched; only parameters added
//! through the builders are encoded here. RFC 3986 unreserved characters
//! pass through, everything else is percent-encoded with uppercase hex.

use crate::headers::KeyValues;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode one key or value.
#[must_use]
pub fn encode(value: &str) -> String {
    utf8_percent_encode(value, UNRESERVED).to_string()
}

/// `k1=v1&k2=v2` with every key and value encoded, in key order.
#[must_use]
pub fn encode_parameters(parameters: &KeyValues) -> String {
    parameters
        .iter()
        .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Append encoded parameters to `url`, continuing an existing query string
/// if there is one.
#[must_use]
pub fn with_parameters(url: &str, parameters: &KeyValues) -> String {
    if parameters.is_empty() {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{}", encode_parameters(parameters))
}
