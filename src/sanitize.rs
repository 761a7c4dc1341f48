//! Body decoding and size-bounded truncation
//!
//! Bodies are carried as JSON values; text that is not JSON is a
//! `Value::String`. Lengths and slice points are counted in characters.

use std::borrow::Cow;

use serde_json::{json, Value};
use tracing::debug;

use crate::Result;

/// Characters of the truncated slice kept in a preview object
pub const PREVIEW_CHARS: usize = 500;

/// Cap applied to non-JSON response text before size limiting
pub const TEXT_PREVIEW_CHARS: usize = 1000;

/// Marker appended to every cut string
pub const ELLIPSIS: &str = "...";

/// Result of sanitizing one body
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedBody {
    /// Body as it goes into the entry
    pub body: Value,
    /// Whether the size limit cut the body
    pub truncated: bool,
    /// Serialized length before truncation; present iff `truncated`
    pub original_size: Option<usize>,
}

impl SanitizedBody {
    fn untouched(body: Value) -> Self {
        Self {
            body,
            truncated: false,
            original_size: None,
        }
    }
}

/// Bound `body` to `limit` characters of serialized text
///
/// Structured bodies are cut on their compact JSON form and re-parsed; when
/// the cut lands mid-token the result is a preview object instead. Text that
/// is not JSON is cut as plain text.
#[must_use]
pub fn sanitize(body: Value, limit: usize) -> SanitizedBody {
    let (serialized, structured) = match &body {
        Value::Null => return SanitizedBody::untouched(Value::Null),
        Value::String(text) => (
            Cow::Borrowed(text.as_str()),
            serde_json::from_str::<Value>(text).is_ok(),
        ),
        other => (Cow::Owned(other.to_string()), true),
    };

    let original_size = serialized.chars().count();
    if original_size <= limit {
        return SanitizedBody::untouched(body);
    }

    let slice = take_chars(&serialized, limit);
    let cut = if structured {
        serde_json::from_str::<Value>(slice).unwrap_or_else(|_| preview(slice))
    } else {
        Value::String(format!("{slice}{ELLIPSIS}"))
    };

    SanitizedBody {
        body: cut,
        truncated: true,
        original_size: Some(original_size),
    }
}

/// Decode response text according to its content type
///
/// JSON content types must parse or the body is `null`. Anything else is
/// parsed best-effort and otherwise kept as text capped at
/// [`TEXT_PREVIEW_CHARS`]. A failed read is `null`.
#[must_use]
pub fn decode_response_body(content_type: Option<&str>, text: Result<String>) -> Value {
    let text = match text {
        Ok(text) => text,
        Err(e) => {
            debug!("Response body unavailable: {}", e);
            return Value::Null;
        }
    };

    if content_type.is_some_and(|ct| ct.contains("application/json")) {
        return serde_json::from_str(&text).unwrap_or_else(|e| {
            debug!("Invalid JSON response body: {}", e);
            Value::Null
        });
    }

    serde_json::from_str(&text).unwrap_or_else(|_| {
        if text.chars().count() > TEXT_PREVIEW_CHARS {
            Value::String(format!("{}{ELLIPSIS}", take_chars(&text, TEXT_PREVIEW_CHARS)))
        } else {
            Value::String(text)
        }
    })
}

/// Decode a request's post data: JSON if it parses, raw text otherwise
#[must_use]
pub fn decode_request_body(post_data: Result<Option<String>>) -> Value {
    match post_data {
        Ok(Some(data)) if !data.is_empty() => {
            serde_json::from_str(&data).unwrap_or(Value::String(data))
        }
        Ok(_) => Value::Null,
        Err(e) => {
            debug!("Request body unavailable: {}", e);
            Value::Null
        }
    }
}

fn preview(slice: &str) -> Value {
    json!({
        "_truncated": true,
        "_preview": format!("{}{ELLIPSIS}", take_chars(slice, PREVIEW_CHARS)),
    })
}

/// First `n` characters of `s`
fn take_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecorderError;
    use proptest::prelude::*;

    fn json_of_len(len: usize) -> Value {
        // {"data":""} is 11 characters
        json!({ "data": "x".repeat(len - 11) })
    }

    #[test]
    fn test_null_passthrough() {
        let out = sanitize(Value::Null, 10);
        assert_eq!(out.body, Value::Null);
        assert!(!out.truncated);
        assert!(out.original_size.is_none());
    }

    #[test]
    fn test_within_limit_unchanged() {
        let body = json_of_len(50);
        let out = sanitize(body.clone(), 100);
        assert_eq!(out.body, body);
        assert!(!out.truncated);
        assert!(out.original_size.is_none());
    }

    #[test]
    fn test_exact_limit_unchanged() {
        let body = json_of_len(100);
        assert_eq!(body.to_string().len(), 100);
        assert!(!sanitize(body, 100).truncated);
    }

    #[test]
    fn test_structured_cut_mid_token_gives_preview() {
        let out = sanitize(json_of_len(500), 100);
        assert!(out.truncated);
        assert_eq!(out.original_size, Some(500));
        assert_eq!(out.body["_truncated"], json!(true));

        let preview = out.body["_preview"].as_str().unwrap();
        assert!(preview.starts_with("{\"data\":\"xxx"));
        assert!(preview.ends_with(ELLIPSIS));
        assert_eq!(preview.chars().count(), 100 + ELLIPSIS.len());
    }

    #[test]
    fn test_preview_is_capped() {
        let out = sanitize(json_of_len(5000), 2000);
        let preview = out.body["_preview"].as_str().unwrap();
        assert_eq!(preview.chars().count(), PREVIEW_CHARS + ELLIPSIS.len());
    }

    #[test]
    fn test_structured_cut_that_reparses() {
        let out = sanitize(json!(123_456_789), 4);
        assert_eq!(out.body, json!(1234));
        assert!(out.truncated);
        assert_eq!(out.original_size, Some(9));

        // JSON text carried as a string is cut the same way
        let out = sanitize(Value::String("12345678".to_string()), 4);
        assert_eq!(out.body, json!(1234));
    }

    #[test]
    fn test_plain_text_cut() {
        let text = "hello world, this is not json".to_string();
        let out = sanitize(Value::String(text), 5);
        assert_eq!(out.body, json!("hello..."));
        assert!(out.truncated);
        assert_eq!(out.original_size, Some(29));
    }

    #[test]
    fn test_cut_counts_characters() {
        let out = sanitize(Value::String("日本語のテキスト".to_string()), 3);
        assert_eq!(out.body, json!("日本語..."));
        assert_eq!(out.original_size, Some(8));
    }

    #[test]
    fn test_key_order_is_preserved() {
        let text = r#"{"zeta":1,"alpha":2}"#;
        let body = decode_response_body(Some("application/json"), Ok(text.to_string()));

        let out = sanitize(body.clone(), 10_000);
        assert_eq!(out.body.to_string(), text);

        // The cut is taken from the body as received
        let out = sanitize(body, 9);
        assert_eq!(out.original_size, Some(20));
        assert_eq!(out.body["_preview"], json!("{\"zeta\":1..."));
    }

    #[test]
    fn test_decode_json_content_type() {
        let body = decode_response_body(
            Some("application/json; charset=utf-8"),
            Ok(r#"{"rooms":[1,2]}"#.to_string()),
        );
        assert_eq!(body, json!({"rooms": [1, 2]}));

        let body = decode_response_body(Some("application/json"), Ok("<html>".to_string()));
        assert_eq!(body, Value::Null);
    }

    #[test]
    fn test_decode_text_best_effort() {
        let body = decode_response_body(Some("text/plain"), Ok("[1,2,3]".to_string()));
        assert_eq!(body, json!([1, 2, 3]));

        let body = decode_response_body(None, Ok("plain".to_string()));
        assert_eq!(body, json!("plain"));

        let long = "a".repeat(1500);
        let body = decode_response_body(Some("text/html"), Ok(long));
        assert_eq!(
            body.as_str().unwrap().chars().count(),
            TEXT_PREVIEW_CHARS + ELLIPSIS.len()
        );
    }

    #[test]
    fn test_decode_read_failure_is_null() {
        let body = decode_response_body(
            Some("application/json"),
            Err(RecorderError::Protocol("No resource with given identifier".to_string())),
        );
        assert_eq!(body, Value::Null);
    }

    #[test]
    fn test_decode_request_body() {
        assert_eq!(decode_request_body(Ok(None)), Value::Null);
        assert_eq!(decode_request_body(Ok(Some(String::new()))), Value::Null);
        assert_eq!(
            decode_request_body(Ok(Some(r#"{"a":1}"#.to_string()))),
            json!({"a": 1})
        );
        assert_eq!(
            decode_request_body(Ok(Some("a=1&b=2".to_string()))),
            json!("a=1&b=2")
        );
        assert_eq!(
            decode_request_body(Err(RecorderError::Other("gone".to_string()))),
            Value::Null
        );
    }

    proptest! {
        #[test]
        fn prop_truncation_invariant(len in 11usize..400, limit in 1usize..300) {
            let out = sanitize(json_of_len(len), limit);
            if out.truncated {
                let size = out.original_size.unwrap();
                prop_assert!(size > limit);
                prop_assert_eq!(size, len);
            } else {
                prop_assert!(out.original_size.is_none());
                prop_assert!(len <= limit);
            }
        }

        #[test]
        fn prop_untruncated_is_idempotent(text in "[a-z {}:\",0-9]{0,60}", limit in 60usize..100) {
            let first = sanitize(Value::String(text), limit);
            prop_assert!(!first.truncated);
            let second = sanitize(first.body.clone(), limit);
            prop_assert_eq!(first, second);
        }
    }
}
