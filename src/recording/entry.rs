//! Entry and session record types
//!
//! These serialize directly into the scenario JSON file.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::FilterConfig;
use crate::headers::Headers;

/// One recorded request/response exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Commit ordinal, starting at 1
    pub seq: u64,
    /// ISO-8601 time the entry was committed
    pub timestamp: String,
    /// Page active when the response was captured
    pub page_url: String,
    /// Request duration; `null` when timing was unusable
    pub duration_ms: Option<u64>,
    /// Request half
    pub request: RequestRecord,
    /// Response half
    pub response: ResponseRecord,
}

/// Recorded request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// HTTP method
    pub method: String,
    /// Path and query; the origin is recorded once as `base_url`
    pub url: String,
    /// Allow-listed headers
    pub headers: Headers,
    /// Decoded body
    pub body: Value,
}

/// Recorded response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    /// HTTP status code
    pub status: u16,
    /// HTTP status text
    pub status_text: String,
    /// Allow-listed headers
    pub headers: Headers,
    /// Decoded, size-bounded body
    pub body: Value,
    /// Whether the body was cut to the size limit
    pub body_truncated: bool,
    /// Serialized size before truncation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_original_size: Option<usize>,
}

/// Final aggregated output of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Scenario name
    pub scenario: String,
    /// When recording started
    pub recorded_at: String,
    /// Origin of the initially navigated URL
    pub base_url: String,
    /// Filter settings in effect
    pub config: FilterConfig,
    /// Entries in commit order
    pub entries: Vec<Entry>,
}

/// ISO-8601 UTC timestamp with millisecond precision
#[must_use]
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Compact `YYYYMMDD_HHMMSS` stamp used in generated names
#[must_use]
pub fn compact_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

/// Scenario name generated from a start time
#[must_use]
pub fn default_scenario_name(at: DateTime<Utc>) -> String {
    format!("scenario_{}", compact_timestamp(at))
}
