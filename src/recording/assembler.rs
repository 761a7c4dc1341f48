//! Turn in-scope exchanges into sequenced entries
//!
//! Assembly is split in two: [`prepare`] does everything that may suspend
//! (body reads) and can run concurrently for many exchanges; [`Sequencer::seal`]
//! is the synchronous commit step that assigns `seq` and must run under the
//! session lock.

use chrono::Utc;
use serde_json::Value;

use crate::capture::{Exchange, Timing};
use crate::headers::{header_value, redact, Headers};
use crate::sanitize::{decode_request_body, decode_response_body, sanitize, SanitizedBody};

use super::entry::{iso_timestamp, Entry, RequestRecord, ResponseRecord};

/// An exchange with bodies read, sanitized and headers redacted
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedExchange {
    method: String,
    path: String,
    request_headers: Headers,
    request_body: Value,
    status: u16,
    status_text: String,
    response_headers: Headers,
    response_body: SanitizedBody,
    page_url: String,
    duration_ms: Option<u64>,
}

/// Read and sanitize both bodies of `exchange`
///
/// `path` is the exchange's path+query as computed during scope matching.
pub async fn prepare(exchange: Exchange, path: String, body_limit: usize) -> PreparedExchange {
    let Exchange {
        request,
        response,
        page_url,
        timing,
    } = exchange;

    let content_type = header_value(&response.headers, "content-type").map(str::to_owned);
    let (post_data, response_text) = futures_util::join!(request.body, response.body);

    // Request bodies rarely hit the limit; only the value is kept
    let request_body = sanitize(decode_request_body(post_data), body_limit).body;
    let response_body = sanitize(
        decode_response_body(content_type.as_deref(), response_text),
        body_limit,
    );

    PreparedExchange {
        method: request.method,
        path,
        request_headers: redact(&request.headers),
        request_body,
        status: response.status,
        status_text: response.status_text,
        response_headers: redact(&response.headers),
        response_body,
        page_url,
        duration_ms: duration_ms(timing.as_ref()),
    }
}

/// Rounded request duration; non-positive or non-finite values are unusable
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub fn duration_ms(timing: Option<&Timing>) -> Option<u64> {
    let timing = timing?;
    let duration = (timing.response_end_ms - timing.request_start_ms).round();
    (duration.is_finite() && duration > 0.0).then(|| duration as u64)
}

/// Per-session sequence counter
#[derive(Debug, Default)]
pub struct Sequencer {
    last: u64,
}

impl Sequencer {
    /// Create a counter whose first entry gets `seq = 1`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next sequence number and stamp the commit time
    pub fn seal(&mut self, prepared: PreparedExchange) -> Entry {
        self.last += 1;

        Entry {
            seq: self.last,
            timestamp: iso_timestamp(Utc::now()),
            page_url: prepared.page_url,
            duration_ms: prepared.duration_ms,
            request: RequestRecord {
                method: prepared.method,
                url: prepared.path,
                headers: prepared.request_headers,
                body: prepared.request_body,
            },
            response: ResponseRecord {
                status: prepared.status,
                status_text: prepared.status_text,
                headers: prepared.response_headers,
                body: prepared.response_body.body,
                body_truncated: prepared.response_body.truncated,
                body_original_size: prepared.response_body.original_size,
            },
        }
    }

    /// Last assigned sequence number, 0 before the first entry
    #[must_use]
    pub fn last(&self) -> u64 {
        self.last
    }
}
