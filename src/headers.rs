//! Header allow-list redaction

use std::collections::BTreeMap;

/// Header map as stored in entries
pub type Headers = BTreeMap<String, String>;

/// Header names (lower-cased) that survive redaction
pub const ALLOWED_HEADERS: &[&str] = &[
    "content-type",
    "accept",
    "authorization",
    "cookie",
    "cache-control",
    "content-length",
];

/// Keep only allow-listed headers, preserving their original casing
#[must_use]
pub fn redact(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| is_allowed(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Case-insensitive header lookup
#[must_use]
pub fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn is_allowed(name: &str) -> bool {
    ALLOWED_HEADERS
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(name))
}
