// SPDX-License-Identifier: MIT OR Apache-2.0
//! Payload content types and the inline-vs-object-store selector.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// MIME content type of a message payload.
///
/// These are the only content types the protocol understands; an inbound
/// message carrying any other MIME string is treated as a version
/// incompatibility by the dispatch engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(into = "String", try_from = "String")]
pub enum ContentType {
    /// `application/json` — the default for structured payloads.
    #[default]
    Json,
    /// `text/plain` — raw UTF-8 text.
    Text,
    /// `application/octet-stream` — opaque bytes, base64-embedded on the wire.
    Binary,
}

impl ContentType {
    /// The canonical MIME string.
    #[must_use]
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Text => "text/plain",
            Self::Binary => "application/octet-stream",
        }
    }

    /// Whether payload bytes must be base64-embedded in the JSON envelope.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary)
    }

    /// Parse a MIME string.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownContentType`] for MIME strings outside the protocol.
    pub fn parse(mime: &str) -> Result<Self, UnknownContentType> {
        match mime {
            "application/json" => Ok(Self::Json),
            "text/plain" => Ok(Self::Text),
            "application/octet-stream" => Ok(Self::Binary),
            other => Err(UnknownContentType(other.to_string())),
        }
    }
}

/// A MIME string outside the protocol's content-type enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown content type '{0}'")]
pub struct UnknownContentType(pub String);

impl From<ContentType> for String {
    fn from(value: ContentType) -> Self {
        value.mime().to_string()
    }
}

impl TryFrom<String> for ContentType {
    type Error = UnknownContentType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mime())
    }
}

/// Selects whether payload bytes travel inline (`Message`) or as a
/// reference into an external object store (`Minio`).
///
/// Userspace and lifecycle headers carry the numeric form (`0`/`1`); event
/// headers carry the enum name so the value survives string-only header
/// transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(into = "u8", try_from = "u8")]
pub enum DataHandler {
    /// Payload bytes are the actual data.
    #[default]
    Message,
    /// Payload bytes are a JSON reference into a MinIO-style object store.
    Minio,
}

impl DataHandler {
    /// Numeric wire form.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::Message => 0,
            Self::Minio => 1,
        }
    }

    /// Enum-name wire form, used in string-only header maps.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Message => "MESSAGE",
            Self::Minio => "MINIO",
        }
    }

    /// Parse the numeric wire form.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownDataHandler`] for values other than 0 or 1.
    pub fn from_code(code: i64) -> Result<Self, UnknownDataHandler> {
        match code {
            0 => Ok(Self::Message),
            1 => Ok(Self::Minio),
            other => Err(UnknownDataHandler(other.to_string())),
        }
    }

    /// Parse the enum-name wire form.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownDataHandler`] for names other than `MESSAGE`/`MINIO`.
    pub fn from_name(name: &str) -> Result<Self, UnknownDataHandler> {
        match name {
            "MESSAGE" => Ok(Self::Message),
            "MINIO" => Ok(Self::Minio),
            other => Err(UnknownDataHandler(other.to_string())),
        }
    }
}

/// A data-handler value outside the protocol enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown data handler '{0}'")]
pub struct UnknownDataHandler(pub String);

impl From<DataHandler> for u8 {
    fn from(value: DataHandler) -> Self {
        value.code()
    }
}

impl TryFrom<u8> for DataHandler {
    type Error = UnknownDataHandler;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_code(i64::from(value))
    }
}
