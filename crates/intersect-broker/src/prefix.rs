// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reserved envelope prefix for transports without native header support.
//!
//! MQTT 3.1.1 has no per-message properties, so header maps and the
//! content type are embedded ahead of the payload: an 8-byte magic, a
//! big-endian u32 metadata length, the metadata JSON, then the raw payload
//! bytes. Frames without the magic decode as a bare payload with empty
//! headers, so mixed peers stay readable.

use serde_json::json;
use std::collections::BTreeMap;

const MAGIC: &[u8; 8] = b"ISDKHDR1";

/// Embed headers and content type ahead of the payload.
#[must_use]
pub fn encode(
    headers: &BTreeMap<String, String>,
    content_type: &str,
    payload: &[u8],
) -> Vec<u8> {
    let meta = json!({
        "contentType": content_type,
        "headers": headers,
    });
    let meta_bytes = serde_json::to_vec(&meta).unwrap_or_default();
    let mut frame = Vec::with_capacity(MAGIC.len() + 4 + meta_bytes.len() + payload.len());
    frame.extend_from_slice(MAGIC);
    frame.extend_from_slice(&u32::try_from(meta_bytes.len()).unwrap_or(0).to_be_bytes());
    frame.extend_from_slice(&meta_bytes);
    frame.extend_from_slice(payload);
    frame
}

/// Split a frame into `(headers, content_type, payload)`.
///
/// Frames without the magic prefix decode as `(empty, "", frame)`.
#[must_use]
pub fn decode(frame: &[u8]) -> (BTreeMap<String, String>, String, Vec<u8>) {
    let fallback = || (BTreeMap::new(), String::new(), frame.to_vec());
    if frame.len() < MAGIC.len() + 4 || &frame[..MAGIC.len()] != MAGIC {
        return fallback();
    }
    let len_start = MAGIC.len();
    let meta_len = u32::from_be_bytes([
        frame[len_start],
        frame[len_start + 1],
        frame[len_start + 2],
        frame[len_start + 3],
    ]) as usize;
    let meta_start = len_start + 4;
    let Some(payload_start) = meta_start.checked_add(meta_len).filter(|&end| end <= frame.len())
    else {
        return fallback();
    };
    let Ok(meta) = serde_json::from_slice::<serde_json::Value>(&frame[meta_start..payload_start])
    else {
        return fallback();
    };
    let content_type = meta
        .get("contentType")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    let mut headers = BTreeMap::new();
    if let Some(map) = meta.get("headers").and_then(serde_json::Value::as_object) {
        for (key, value) in map {
            if let Some(s) = value.as_str() {
                headers.insert(key.clone(), s.to_string());
            }
        }
    }
    (headers, content_type, frame[payload_start..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let headers = BTreeMap::from([
            ("source".to_string(), "o.f.s.svc".to_string()),
            ("sdk_version".to_string(), "0.1.0".to_string()),
        ]);
        let frame = encode(&headers, "application/json", b"{\"x\":1}");
        let (back_headers, content_type, payload) = decode(&frame);
        assert_eq!(back_headers, headers);
        assert_eq!(content_type, "application/json");
        assert_eq!(payload, b"{\"x\":1}");
    }

    #[test]
    fn unprefixed_frames_pass_through() {
        let (headers, content_type, payload) = decode(b"plain bytes");
        assert!(headers.is_empty());
        assert!(content_type.is_empty());
        assert_eq!(payload, b"plain bytes");
    }

    #[test]
    fn truncated_metadata_passes_through() {
        let mut frame = Vec::new();
        frame.extend_from_slice(b"ISDKHDR1");
        frame.extend_from_slice(&1000u32.to_be_bytes());
        frame.extend_from_slice(b"short");
        let (headers, _, payload) = decode(&frame);
        assert!(headers.is_empty());
        assert_eq!(payload, frame);
    }
}
