// SPDX-License-Identifier: MIT OR Apache-2.0
//! Message envelopes: userspace requests/replies, events, and lifecycle
//! control messages.
//!
//! All three envelopes share one JSON encoding: outer keys `messageId`,
//! `operationId` (userspace only), `contentType`, `payload`, `headers`.
//! The payload rides as a JSON string — UTF-8 text for textual content
//! types, base64 for `application/octet-stream`. Inbound envelopes are
//! validated collect-all style (see [`crate::validation`]).

pub mod event;
pub mod lifecycle;
pub mod userspace;

use crate::content::ContentType;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

/// An outbound envelope could not be encoded.
#[derive(Debug, Error)]
pub enum MessageEncodeError {
    /// Payload bytes are not valid UTF-8 but the content type is textual.
    #[error("payload is not valid UTF-8 for content type {content_type}")]
    NonUtf8Payload {
        /// The textual content type that was declared.
        content_type: ContentType,
    },

    /// JSON serialization failed.
    #[error("envelope serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Embed payload bytes as the envelope's payload string.
pub(crate) fn encode_payload(
    content_type: ContentType,
    payload: &[u8],
) -> Result<String, MessageEncodeError> {
    if content_type.is_binary() {
        Ok(BASE64.encode(payload))
    } else {
        match std::str::from_utf8(payload) {
            Ok(text) => Ok(text.to_string()),
            Err(_) => Err(MessageEncodeError::NonUtf8Payload { content_type }),
        }
    }
}

/// Recover payload bytes from the envelope's payload string.
///
/// Returns `None` when a binary payload string is not valid base64.
pub(crate) fn decode_payload(content_type: ContentType, raw: &str) -> Option<Vec<u8>> {
    if content_type.is_binary() {
        BASE64.decode(raw).ok()
    } else {
        Some(raw.as_bytes().to_vec())
    }
}

/// Decode payload bytes into the JSON value schemas validate against.
///
/// JSON payloads parse (empty bytes read as `null`), text payloads become
/// a JSON string, binary payloads become their base64 string form.
/// Returns `None` when the bytes do not fit the content type.
#[must_use]
pub fn payload_to_value(content_type: ContentType, payload: &[u8]) -> Option<serde_json::Value> {
    match content_type {
        ContentType::Json => {
            if payload.is_empty() {
                Some(serde_json::Value::Null)
            } else {
                serde_json::from_slice(payload).ok()
            }
        }
        ContentType::Text => std::str::from_utf8(payload)
            .ok()
            .map(|text| serde_json::Value::String(text.to_string())),
        ContentType::Binary => Some(serde_json::Value::String(BASE64.encode(payload))),
    }
}

/// Encode a JSON value as payload bytes for the given content type.
///
/// The inverse of [`payload_to_value`]: text payloads must be JSON
/// strings, binary payloads must be base64 strings.
#[must_use]
pub fn value_to_payload(content_type: ContentType, value: &serde_json::Value) -> Option<Vec<u8>> {
    match content_type {
        ContentType::Json => serde_json::to_vec(value).ok(),
        ContentType::Text => value.as_str().map(|text| text.as_bytes().to_vec()),
        ContentType::Binary => value.as_str().and_then(|raw| BASE64.decode(raw).ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn textual_payload_passes_through() {
        let encoded = encode_payload(ContentType::Json, b"{\"a\":1}").unwrap();
        assert_eq!(encoded, "{\"a\":1}");
        assert_eq!(decode_payload(ContentType::Json, &encoded).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn binary_payload_is_base64() {
        let bytes = [0u8, 159, 146, 150];
        let encoded = encode_payload(ContentType::Binary, &bytes).unwrap();
        assert_ne!(encoded.as_bytes(), bytes);
        assert_eq!(decode_payload(ContentType::Binary, &encoded).unwrap(), bytes);
    }

    #[test]
    fn non_utf8_textual_payload_rejected() {
        let err = encode_payload(ContentType::Text, &[0xFF, 0xFE]).unwrap_err();
        assert!(matches!(err, MessageEncodeError::NonUtf8Payload { .. }));
    }
}
