// SPDX-License-Identifier: MIT OR Apache-2.0
//! Userspace messages: operation requests and their replies.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::{MessageEncodeError, decode_payload, encode_payload};
use crate::content::{ContentType, DataHandler};
use crate::validation::{
    ErrorKind, FieldErrors, MessageValidationError, optional_bool, optional_str, optional_uuid,
    parse_created_at, reject_unknown_keys, require_str, require_uuid, valid_source,
};
use crate::version::{is_strict_semver, version_string};

const ENVELOPE_KEYS: &[&str] = &["messageId", "operationId", "contentType", "payload", "headers"];
const HEADER_KEYS: &[&str] = &[
    "source",
    "destination",
    "sdk_version",
    "created_at",
    "data_handler",
    "has_error",
    "campaign_id",
    "request_id",
    "encryption_scheme",
];

/// Validated headers of a [`UserspaceMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserspaceHeaders {
    /// Hierarchy name of the sender.
    pub source: String,
    /// Hierarchy name of the addressed service.
    pub destination: String,
    /// Strict `MAJOR.MINOR.PATCH` version the sender speaks.
    pub sdk_version: String,
    /// UTC creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Inline payload vs object-store reference.
    pub data_handler: DataHandler,
    /// `true` when the payload is an [`crate::ErrorRecord`] instead of the
    /// operation's declared response type.
    pub has_error: bool,
    /// Correlation id linking messages of one campaign.
    pub campaign_id: Option<Uuid>,
    /// Correlation id linking a reply to its request.
    pub request_id: Option<Uuid>,
    /// Opaque per-message encryption hook. Carried, never interpreted.
    pub encryption_scheme: Option<String>,
}

/// An operation request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserspaceMessage {
    /// Unique id of this message (UUIDv4).
    pub message_id: Uuid,
    /// `CapabilityName.method_name` of the addressed operation.
    pub operation_id: String,
    /// Content type of the payload bytes.
    pub content_type: ContentType,
    /// Raw payload bytes (already decoded from the wire string).
    pub payload: Vec<u8>,
    /// Validated headers.
    pub headers: UserspaceHeaders,
}

/// Optional knobs for [`UserspaceMessage::create`].
#[derive(Debug, Clone, Default)]
pub struct UserspaceMessageOptions {
    /// Payload content type. Defaults to JSON.
    pub content_type: ContentType,
    /// Inline vs object-store payload. Defaults to inline.
    pub data_handler: DataHandler,
    /// Marks the payload as an error record.
    pub has_error: bool,
    /// Campaign correlation id.
    pub campaign_id: Option<Uuid>,
    /// Request correlation id (set on replies and tracked requests).
    pub request_id: Option<Uuid>,
    /// Opaque encryption hook.
    pub encryption_scheme: Option<String>,
}

impl UserspaceMessage {
    /// Create a new message with a fresh UUIDv4 id, the current UTC time,
    /// and this SDK's version stamped into the headers.
    #[must_use]
    pub fn create(
        source: impl Into<String>,
        destination: impl Into<String>,
        operation_id: impl Into<String>,
        payload: Vec<u8>,
        options: UserspaceMessageOptions,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            operation_id: operation_id.into(),
            content_type: options.content_type,
            payload,
            headers: UserspaceHeaders {
                source: source.into(),
                destination: destination.into(),
                sdk_version: version_string().to_string(),
                created_at: Utc::now(),
                data_handler: options.data_handler,
                has_error: options.has_error,
                campaign_id: options.campaign_id,
                request_id: options.request_id,
                encryption_scheme: options.encryption_scheme,
            },
        }
    }

    /// Encode to the canonical JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns [`MessageEncodeError`] when the payload cannot be embedded.
    pub fn serialize(&self) -> Result<Vec<u8>, MessageEncodeError> {
        let payload = encode_payload(self.content_type, &self.payload)?;
        let mut headers = json!({
            "source": self.headers.source,
            "destination": self.headers.destination,
            "sdk_version": self.headers.sdk_version,
            "created_at": self
                .headers
                .created_at
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            "data_handler": self.headers.data_handler.code(),
            "has_error": self.headers.has_error,
        });
        if let Some(map) = headers.as_object_mut() {
            if let Some(id) = self.headers.campaign_id {
                map.insert("campaign_id".into(), json!(id.to_string()));
            }
            if let Some(id) = self.headers.request_id {
                map.insert("request_id".into(), json!(id.to_string()));
            }
            if let Some(scheme) = &self.headers.encryption_scheme {
                map.insert("encryption_scheme".into(), json!(scheme));
            }
        }
        let envelope = json!({
            "messageId": self.message_id.to_string(),
            "operationId": self.operation_id,
            "contentType": self.content_type.mime(),
            "payload": payload,
            "headers": headers,
        });
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Decode and validate an inbound envelope.
    ///
    /// Unknown fields are rejected (strict mode); every field problem is
    /// collected into the returned error.
    ///
    /// # Errors
    ///
    /// [`MessageValidationError::Malformed`] when the bytes are not a JSON
    /// object, [`MessageValidationError::Invalid`] listing `{path, kind}`
    /// pairs otherwise.
    pub fn deserialize_and_validate(bytes: &[u8]) -> Result<Self, MessageValidationError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let mut errors = FieldErrors::new();
        let Some(envelope) = value.as_object() else {
            errors.push("", ErrorKind::Missing);
            return Err(MessageValidationError::Invalid(errors));
        };
        reject_unknown_keys(envelope, ENVELOPE_KEYS, "", &mut errors);

        let message_id = require_uuid(envelope, "messageId", "", &mut errors);
        let operation_id = require_str(envelope, "operationId", "", &mut errors).map(str::to_string);
        // contentType defaults to JSON when absent
        let content_type = match optional_str(envelope, "contentType", "", &mut errors) {
            None => Some(ContentType::default()),
            Some(raw) => ContentType::parse(raw)
                .inspect_err(|_| errors.push("contentType", ErrorKind::Enum))
                .ok(),
        };
        let raw_payload = require_str(envelope, "payload", "", &mut errors).map(str::to_string);

        let headers = match envelope.get("headers") {
            None | Some(Value::Null) => {
                errors.push("headers", ErrorKind::Missing);
                None
            }
            Some(Value::Object(map)) => validate_headers(map, &mut errors),
            Some(_) => {
                errors.push("headers", ErrorKind::Missing);
                None
            }
        };

        let payload = match (content_type, &raw_payload) {
            (Some(ct), Some(raw)) => decode_payload(ct, raw).or_else(|| {
                errors.push("payload", ErrorKind::StringPatternMismatch);
                None
            }),
            _ => None,
        };

        match (message_id, operation_id, content_type, payload, headers) {
            (Some(message_id), Some(operation_id), Some(content_type), Some(payload), Some(headers))
                if errors.is_empty() =>
            {
                Ok(Self {
                    message_id,
                    operation_id,
                    content_type,
                    payload,
                    headers,
                })
            }
            _ => Err(MessageValidationError::Invalid(errors)),
        }
    }
}

fn validate_headers(map: &Map<String, Value>, errors: &mut FieldErrors) -> Option<UserspaceHeaders> {
    reject_unknown_keys(map, HEADER_KEYS, "headers", errors);

    let source = require_str(map, "source", "headers", errors).and_then(|s| {
        if valid_source(s) {
            Some(s.to_string())
        } else {
            errors.push("headers.source", ErrorKind::StringPatternMismatch);
            None
        }
    });
    let destination = require_str(map, "destination", "headers", errors).and_then(|s| {
        if valid_source(s) {
            Some(s.to_string())
        } else {
            errors.push("headers.destination", ErrorKind::StringPatternMismatch);
            None
        }
    });
    let sdk_version = require_str(map, "sdk_version", "headers", errors).and_then(|s| {
        if is_strict_semver(s) {
            Some(s.to_string())
        } else {
            errors.push("headers.sdk_version", ErrorKind::StringPatternMismatch);
            None
        }
    });
    let created_at = match map.get("created_at") {
        None | Some(Value::Null) => {
            errors.push("headers.created_at", ErrorKind::Missing);
            None
        }
        Some(value) => parse_created_at(value, "headers.created_at", errors),
    };
    let data_handler = match map.get("data_handler") {
        None | Some(Value::Null) => Some(DataHandler::default()),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|code| DataHandler::from_code(code).ok())
            .or_else(|| {
                errors.push("headers.data_handler", ErrorKind::Enum);
                None
            }),
        Some(_) => {
            errors.push("headers.data_handler", ErrorKind::Enum);
            None
        }
    };
    let has_error = optional_bool(map, "has_error", "headers", errors).unwrap_or(false);
    let campaign_id = optional_uuid(map, "campaign_id", "headers", errors);
    let request_id = optional_uuid(map, "request_id", "headers", errors);
    let encryption_scheme = optional_str(map, "encryption_scheme", "headers", errors).map(str::to_string);

    Some(UserspaceHeaders {
        source: source?,
        destination: destination?,
        sdk_version: sdk_version?,
        created_at: created_at?,
        data_handler: data_handler?,
        has_error,
        campaign_id,
        request_id,
        encryption_scheme,
    })
}

/// Routing fields recovered leniently from an envelope that may not pass
/// full validation, so the dispatcher can still address an error reply.
#[derive(Debug, Clone, Default)]
pub struct RoutingHints {
    /// The message id, if a parseable UUID was present.
    pub message_id: Option<Uuid>,
    /// The sender, if a plausible source string was present.
    pub source: Option<String>,
    /// The operation id, if present.
    pub operation_id: Option<String>,
    /// The request correlation id, if a parseable UUID was present.
    pub request_id: Option<Uuid>,
    /// The advertised SDK version string, unvalidated.
    pub sdk_version: Option<String>,
}

impl RoutingHints {
    /// Best-effort extraction; never fails.
    #[must_use]
    pub fn peek(bytes: &[u8]) -> Self {
        let Ok(value) = serde_json::from_slice::<Value>(bytes) else {
            return Self::default();
        };
        let envelope = value.as_object();
        let headers = envelope
            .and_then(|e| e.get("headers"))
            .and_then(Value::as_object);
        Self {
            message_id: envelope
                .and_then(|e| e.get("messageId"))
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok()),
            source: headers
                .and_then(|h| h.get("source"))
                .and_then(Value::as_str)
                .filter(|s| valid_source(s))
                .map(str::to_string),
            operation_id: envelope
                .and_then(|e| e.get("operationId"))
                .and_then(Value::as_str)
                .map(str::to_string),
            request_id: headers
                .and_then(|h| h.get("request_id"))
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok()),
            sdk_version: headers
                .and_then(|h| h.get("sdk_version"))
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_stamps_identity() {
        let msg = UserspaceMessage::create(
            "source",
            "destination",
            "operation",
            b"[1,2,3]".to_vec(),
            UserspaceMessageOptions::default(),
        );
        assert_eq!(msg.message_id.get_version_num(), 4);
        assert_eq!(msg.operation_id, "operation");
        assert_eq!(msg.content_type, ContentType::Json);
        assert_eq!(msg.headers.sdk_version, version_string());
        assert!(!msg.headers.has_error);
        assert_eq!(msg.headers.data_handler, DataHandler::Message);
    }

    #[test]
    fn round_trip_preserves_payload_and_headers() {
        let msg = UserspaceMessage::create(
            "org.fac.sys.svc",
            "org.fac.sys.sub.svc",
            "Cap.op",
            b"\"hello\"".to_vec(),
            UserspaceMessageOptions {
                campaign_id: Some(Uuid::new_v4()),
                request_id: Some(Uuid::new_v4()),
                ..Default::default()
            },
        );
        let bytes = msg.serialize().unwrap();
        let back = UserspaceMessage::deserialize_and_validate(&bytes).unwrap();
        // microsecond truncation on the wire
        assert_eq!(back.message_id, msg.message_id);
        assert_eq!(back.payload, msg.payload);
        assert_eq!(back.headers.source, msg.headers.source);
        assert_eq!(back.headers.campaign_id, msg.headers.campaign_id);
        assert_eq!(back.headers.request_id, msg.headers.request_id);
    }

    #[test]
    fn binary_round_trip() {
        let msg = UserspaceMessage::create(
            "s",
            "d",
            "Cap.op",
            vec![0, 1, 2, 255],
            UserspaceMessageOptions {
                content_type: ContentType::Binary,
                ..Default::default()
            },
        );
        let bytes = msg.serialize().unwrap();
        let back = UserspaceMessage::deserialize_and_validate(&bytes).unwrap();
        assert_eq!(back.payload, vec![0, 1, 2, 255]);
    }
}
