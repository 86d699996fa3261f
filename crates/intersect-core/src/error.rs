// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire-level error taxonomy.
//!
//! Every `has_error=true` reply carries an [`ErrorRecord`] as its payload,
//! regardless of the operation's declared response type. The codes are
//! stable wire strings and must not change across patch releases.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Machine-readable, stable error code carried on error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireErrorCode {
    // -- Startup-fatal --
    /// Configuration failed validation. Raised to the embedding program.
    ConfigInvalid,
    /// Capability schema could not be built. Raised to the embedding program.
    SchemaBuildError,

    // -- Protocol --
    /// Peer SDK version (or an unknown enum value) is incompatible.
    VersionIncompat,
    /// The addressed operation does not exist on this service.
    UnknownOperation,
    /// Request payload failed validation against the operation's schema.
    RequestValidationFailed,
    /// Handler return value could not be serialized as the response type.
    ResponseSerializationFailed,

    // -- Data plane --
    /// Payload bytes could not be fetched from the object store.
    DataFetchFailed,
    /// Payload bytes could not be written to the object store.
    DataStoreFailed,

    // -- Handler --
    /// The user handler returned or raised an error.
    HandlerError,

    // -- Lifecycle --
    /// A correlated request passed its deadline without a response.
    Timeout,
    /// The service shut down with the request still outstanding.
    Shutdown,
}

impl WireErrorCode {
    /// The stable wire string for this code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::SchemaBuildError => "SCHEMA_BUILD_ERROR",
            Self::VersionIncompat => "VERSION_INCOMPAT",
            Self::UnknownOperation => "UNKNOWN_OPERATION",
            Self::RequestValidationFailed => "REQUEST_VALIDATION_FAILED",
            Self::ResponseSerializationFailed => "RESPONSE_SERIALIZATION_FAILED",
            Self::DataFetchFailed => "DATA_FETCH_FAILED",
            Self::DataStoreFailed => "DATA_STORE_FAILED",
            Self::HandlerError => "HANDLER_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for WireErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured payload of an error reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Stable error code.
    pub code: WireErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional machine-readable detail (e.g. the first validation errors).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ErrorRecord {
    /// Create a record with no detail.
    #[must_use]
    pub fn new(code: WireErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    /// Attach machine-readable detail.
    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Serialize to the JSON bytes carried as an error-reply payload.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        // an ErrorRecord always serializes: code is a unit enum, detail is Value
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode an error-reply payload.
    ///
    /// # Errors
    ///
    /// Returns the underlying JSON error when the payload is not a record.
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
