// SPDX-License-Identifier: MIT OR Apache-2.0
//! Collect-all field validation over raw JSON values.
//!
//! Inbound envelopes are validated in one pass that records *every*
//! problem as a `{path, kind}` pair instead of failing on the first, so a
//! peer debugging an integration sees the whole error surface at once.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Machine-readable classification of a single field problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A required field was absent.
    Missing,
    /// An unknown field was present (strict mode only).
    ExtraForbidden,
    /// Value was not a string.
    StringType,
    /// Value was not an integer.
    IntType,
    /// Value was not a boolean.
    BoolType,
    /// String value did not parse as a UUID.
    UuidParsing,
    /// String value did not match the required pattern.
    StringPatternMismatch,
    /// Timestamp parsed but carried no timezone offset.
    TimezoneAware,
    /// Timestamp did not parse at all.
    DatetimeParsing,
    /// Value was outside an enumeration.
    Enum,
    /// Value was not the required literal.
    LiteralError,
    /// String value was shorter than the minimum length.
    StringTooShort,
    /// Numeric value was not strictly greater than the bound.
    GreaterThan,
    /// Numeric value was below the inclusive bound.
    GreaterThanEqual,
}

impl ErrorKind {
    /// The snake_case wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::ExtraForbidden => "extra_forbidden",
            Self::StringType => "string_type",
            Self::IntType => "int_type",
            Self::BoolType => "bool_type",
            Self::UuidParsing => "uuid_parsing",
            Self::StringPatternMismatch => "string_pattern_mismatch",
            Self::TimezoneAware => "timezone_aware",
            Self::DatetimeParsing => "datetime_parsing",
            Self::Enum => "enum",
            Self::LiteralError => "literal_error",
            Self::StringTooShort => "string_too_short",
            Self::GreaterThan => "greater_than",
            Self::GreaterThanEqual => "greater_than_equal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One field problem: where, and what was wrong with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Dotted path to the field (e.g. `headers.source`).
    pub path: String,
    /// Classification of the problem.
    pub kind: ErrorKind,
}

/// An accumulating list of [`FieldError`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldErrors(Vec<FieldError>);

impl FieldErrors {
    /// Create an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one problem.
    pub fn push(&mut self, path: impl Into<String>, kind: ErrorKind) {
        self.0.push(FieldError {
            path: path.into(),
            kind,
        });
    }

    /// `true` when no problems were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of recorded problems.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` when a problem with this exact path and kind was recorded.
    #[must_use]
    pub fn contains(&self, path: &str, kind: ErrorKind) -> bool {
        self.0.iter().any(|e| e.path == path && e.kind == kind)
    }

    /// The recorded problems, in recording order.
    #[must_use]
    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }

    /// Consume into the inner vector.
    #[must_use]
    pub fn into_vec(self) -> Vec<FieldError> {
        self.0
    }

    /// Return `Ok(value)` if empty, otherwise `Err(self)`.
    ///
    /// # Errors
    ///
    /// Returns the accumulated problems when any were recorded.
    pub fn into_result<T>(self, value: T) -> Result<T, Self> {
        if self.is_empty() { Ok(value) } else { Err(self) }
    }
}

impl std::fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for e in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.path, e.kind)?;
            first = false;
        }
        Ok(())
    }
}

impl IntoIterator for FieldErrors {
    type Item = FieldError;
    type IntoIter = std::vec::IntoIter<FieldError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// An inbound envelope was rejected.
#[derive(Debug, Error)]
pub enum MessageValidationError {
    /// The bytes were not a JSON object at all.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The JSON parsed but one or more fields failed validation.
    #[error("message failed validation ({0})")]
    Invalid(FieldErrors),
}

impl MessageValidationError {
    /// The field problems, when this is the [`Invalid`](Self::Invalid) variant.
    #[must_use]
    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match self {
            Self::Invalid(errors) => Some(errors),
            Self::Malformed(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Field extraction helpers
// ---------------------------------------------------------------------------

/// Pull a required string field out of `map`, recording `missing` or
/// `string_type` as appropriate.
pub fn require_str<'a>(
    map: &'a Map<String, Value>,
    key: &str,
    prefix: &str,
    errors: &mut FieldErrors,
) -> Option<&'a str> {
    match map.get(key) {
        None | Some(Value::Null) => {
            errors.push(join(prefix, key), ErrorKind::Missing);
            None
        }
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            errors.push(join(prefix, key), ErrorKind::StringType);
            None
        }
    }
}

/// Pull an optional string field; records `string_type` if present but not
/// a string.
pub fn optional_str<'a>(
    map: &'a Map<String, Value>,
    key: &str,
    prefix: &str,
    errors: &mut FieldErrors,
) -> Option<&'a str> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            errors.push(join(prefix, key), ErrorKind::StringType);
            None
        }
    }
}

/// Pull a required UUID field (string form).
pub fn require_uuid(
    map: &Map<String, Value>,
    key: &str,
    prefix: &str,
    errors: &mut FieldErrors,
) -> Option<Uuid> {
    let raw = require_str(map, key, prefix, errors)?;
    match Uuid::parse_str(raw) {
        Ok(id) => Some(id),
        Err(_) => {
            errors.push(join(prefix, key), ErrorKind::UuidParsing);
            None
        }
    }
}

/// Pull an optional UUID field (string form).
pub fn optional_uuid(
    map: &Map<String, Value>,
    key: &str,
    prefix: &str,
    errors: &mut FieldErrors,
) -> Option<Uuid> {
    let raw = optional_str(map, key, prefix, errors)?;
    match Uuid::parse_str(raw) {
        Ok(id) => Some(id),
        Err(_) => {
            errors.push(join(prefix, key), ErrorKind::UuidParsing);
            None
        }
    }
}

/// Pull an optional boolean field; records `bool_type` on mismatch.
pub fn optional_bool(
    map: &Map<String, Value>,
    key: &str,
    prefix: &str,
    errors: &mut FieldErrors,
) -> Option<bool> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => {
            errors.push(join(prefix, key), ErrorKind::BoolType);
            None
        }
    }
}

/// Parse a `created_at` timestamp.
///
/// Accepts RFC 3339 with an explicit offset; a bare integer (or
/// integer-valued string) is read as seconds since the Unix epoch. A
/// timestamp that parses but carries no offset yields `timezone_aware`.
pub fn parse_created_at(value: &Value, path: &str, errors: &mut FieldErrors) -> Option<DateTime<Utc>> {
    let raw = match value {
        Value::String(s) => s.as_str(),
        Value::Number(n) => {
            return n
                .as_i64()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .or_else(|| {
                    errors.push(path.to_string(), ErrorKind::DatetimeParsing);
                    None
                });
        }
        _ => {
            errors.push(path.to_string(), ErrorKind::DatetimeParsing);
            return None;
        }
    };
    if let Ok(secs) = raw.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single().or_else(|| {
            errors.push(path.to_string(), ErrorKind::DatetimeParsing);
            None
        });
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").is_ok() {
        errors.push(path.to_string(), ErrorKind::TimezoneAware);
    } else {
        errors.push(path.to_string(), ErrorKind::DatetimeParsing);
    }
    None
}

/// `true` for message source/destination strings: dotted lowercase labels,
/// starting with an alphanumeric.
#[must_use]
pub fn valid_source(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
}

/// `true` for capability, operation-method, and event names:
/// `[A-Za-z][A-Za-z0-9_]*`.
#[must_use]
pub fn valid_simple_name(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Record `extra_forbidden` for every key of `map` not in `allowed`.
pub fn reject_unknown_keys(
    map: &Map<String, Value>,
    allowed: &[&str],
    prefix: &str,
    errors: &mut FieldErrors,
) {
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            errors.push(join(prefix, key), ErrorKind::ExtraForbidden);
        }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn collects_missing_and_type_errors() {
        let map = obj(json!({"b": 7}));
        let mut errors = FieldErrors::new();
        assert!(require_str(&map, "a", "", &mut errors).is_none());
        assert!(require_str(&map, "b", "", &mut errors).is_none());
        assert_eq!(errors.len(), 2);
        assert!(errors.contains("a", ErrorKind::Missing));
        assert!(errors.contains("b", ErrorKind::StringType));
    }

    #[test]
    fn created_at_requires_offset() {
        let mut errors = FieldErrors::new();
        let naive = json!("2024-01-19T20:21:14.045591");
        assert!(parse_created_at(&naive, "created_at", &mut errors).is_none());
        assert!(errors.contains("created_at", ErrorKind::TimezoneAware));
    }

    #[test]
    fn created_at_accepts_rfc3339_and_epoch_strings() {
        let mut errors = FieldErrors::new();
        let ok = json!("2024-01-19T20:21:14.045591Z");
        let dt = parse_created_at(&ok, "created_at", &mut errors).unwrap();
        assert_eq!(dt.timezone(), Utc);

        // an integer-valued string reads as seconds since the epoch
        let epoch = json!("2024");
        let dt = parse_created_at(&epoch, "created_at", &mut errors).unwrap();
        assert_eq!(dt.timestamp(), 2024);
        assert!(errors.is_empty());
    }

    #[test]
    fn source_patterns() {
        assert!(valid_source("source"));
        assert!(valid_source("source.one"));
        assert!(valid_source("org.fac.sys.sub.svc"));
        assert!(!valid_source("/"));
        assert!(!valid_source(""));
        assert!(!valid_source("Upper.case"));
    }

    #[test]
    fn simple_name_patterns() {
        assert!(valid_simple_name("HelloExample"));
        assert!(valid_simple_name("say_hello_to_name"));
        assert!(!valid_simple_name("b@d_ch@r$"));
        assert!(!valid_simple_name("1leading_digit"));
    }

    #[test]
    fn unknown_keys_rejected() {
        let map = obj(json!({"known": 1, "mystery": 2}));
        let mut errors = FieldErrors::new();
        reject_unknown_keys(&map, &["known"], "headers", &mut errors);
        assert!(errors.contains("headers.mystery", ErrorKind::ExtraForbidden));
        assert_eq!(errors.len(), 1);
    }
}
