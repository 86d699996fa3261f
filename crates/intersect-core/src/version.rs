// SPDX-License-Identifier: MIT OR Apache-2.0
//! SDK version constants and peer compatibility resolution.
//!
//! The protocol works off a strict `MAJOR.MINOR.PATCH` string and does not
//! understand pre-release or build metadata, so the advertised version is
//! stripped down to the bare triple at first use.

use std::sync::LazyLock;
use thiserror::Error;
use tracing::warn;

static VERSION: LazyLock<(String, (u64, u64, u64))> = LazyLock::new(|| {
    let stripped = strip_version_metadata(env!("CARGO_PKG_VERSION"))
        .unwrap_or_else(|_| "0.0.0".to_string());
    let info = parse_version(&stripped).unwrap_or((0, 0, 0));
    (stripped, info)
});

/// A version string with no embedded `MAJOR.MINOR.PATCH` triple.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("version '{0}' does not contain a MAJOR.MINOR.PATCH semantic version")]
pub struct VersionFormatError(pub String);

/// The strict `MAJOR.MINOR.PATCH` version string this SDK advertises.
#[must_use]
pub fn version_string() -> &'static str {
    &VERSION.0
}

/// The advertised version as a `(major, minor, patch)` triple.
#[must_use]
pub fn version_info() -> (u64, u64, u64) {
    VERSION.1
}

/// `true` when `value` is exactly `MAJOR.MINOR.PATCH` with no suffix.
#[must_use]
pub fn is_strict_semver(value: &str) -> bool {
    parse_strict(value).is_some()
}

/// Parse a strict `MAJOR.MINOR.PATCH` string into its triple.
#[must_use]
pub fn parse_version(value: &str) -> Option<(u64, u64, u64)> {
    parse_strict(value)
}

fn parse_strict(value: &str) -> Option<(u64, u64, u64)> {
    let mut parts = value.split('.');
    let major = parse_number(parts.next()?)?;
    let minor = parse_number(parts.next()?)?;
    let patch = parse_number(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

fn parse_number(part: &str) -> Option<u64> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

/// Extract the first embedded `MAJOR.MINOR.PATCH` triple from a version
/// string, discarding any pre-release or build metadata around it.
///
/// # Errors
///
/// Returns [`VersionFormatError`] when no such triple exists anywhere in
/// the string.
pub fn strip_version_metadata(version: &str) -> Result<String, VersionFormatError> {
    let bytes = version.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        if bytes[start].is_ascii_digit() {
            if let Some(found) = match_triple(&version[start..]) {
                return Ok(found.to_string());
            }
            // skip past this digit run before probing again
            while start < bytes.len() && bytes[start].is_ascii_digit() {
                start += 1;
            }
        } else {
            start += 1;
        }
    }
    Err(VersionFormatError(version.to_string()))
}

/// Match `digits '.' digits '.' digits` at the head of `s`.
fn match_triple(s: &str) -> Option<&str> {
    let mut end = 0;
    for _ in 0..3 {
        let run = s[end..].bytes().take_while(u8::is_ascii_digit).count();
        if run == 0 {
            return None;
        }
        end += run;
        if end < s.len() && s.as_bytes()[end] == b'.' && end + 1 < s.len() {
            end += 1;
        } else {
            break;
        }
    }
    let candidate = &s[..end];
    if parse_strict(candidate).is_some() {
        Some(candidate)
    } else {
        None
    }
}

/// Pure compatibility check between two strict version strings.
///
/// Major versions must match; while either side is pre-release
/// (`major == 0`) minors must match as well. Patch differences are always
/// compatible. Unparseable versions are incompatible.
#[must_use]
pub fn resolve_versions(their_version: &str, our_version: &str) -> bool {
    let (Some(theirs), Some(ours)) = (parse_strict(their_version), parse_strict(our_version))
    else {
        return false;
    };
    if theirs.0 != ours.0 {
        return false;
    }
    if (theirs.0 == 0 || ours.0 == 0) && theirs.1 != ours.1 {
        return false;
    }
    true
}

/// Check a peer's advertised version against this SDK's, logging the
/// incompatibility class with the peer's source name.
#[must_use]
pub fn resolve_peer_version(their_version: &str, source: &str) -> bool {
    resolve_against(their_version, source, version_string())
}

fn resolve_against(their_version: &str, source: &str, our_version: &str) -> bool {
    let (Some(theirs), Some(ours)) = (parse_strict(their_version), parse_strict(our_version))
    else {
        warn!(source, their_version, "unparseable peer SDK version");
        return false;
    };
    if theirs.0 != ours.0 {
        warn!(
            source,
            their_version, our_version, "Major version incompatibility with peer"
        );
        return false;
    }
    if (theirs.0 == 0 || ours.0 == 0) && theirs.1 != ours.1 {
        warn!(
            source,
            their_version, our_version, "Pre-release minor version incompatibility with peer"
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_constants_are_strict() {
        assert!(is_strict_semver(version_string()));
        let (major, minor, patch) = version_info();
        assert_eq!(version_string(), format!("{major}.{minor}.{patch}"));
    }

    #[test]
    fn strict_semver_rejects_metadata() {
        assert!(is_strict_semver("1.0.0"));
        assert!(is_strict_semver("0.12.3"));
        assert!(!is_strict_semver("1.0.0+20130313144700"));
        assert!(!is_strict_semver("1.0.0-alpha"));
        assert!(!is_strict_semver("1.0"));
        assert!(!is_strict_semver("1.0.0.0"));
    }

    #[test]
    fn strips_metadata() {
        assert_eq!(strip_version_metadata("1.2.3").unwrap(), "1.2.3");
        assert_eq!(strip_version_metadata("1.2.3-alpha.1").unwrap(), "1.2.3");
        assert_eq!(strip_version_metadata("v4.5.6+build9").unwrap(), "4.5.6");
        assert!(strip_version_metadata("not-a-version").is_err());
        assert!(strip_version_metadata("1.2").is_err());
    }

    #[test]
    fn release_minor_differences_compatible() {
        assert!(resolve_versions("1.1.0", "1.0.0"));
        assert!(resolve_versions("1.1.0", "1.2.0"));
        assert!(resolve_versions("1.0.0", "1.0.1"));
    }

    #[test]
    fn major_differences_incompatible() {
        assert!(!resolve_versions("2.0.0", "1.0.0"));
        assert!(!resolve_versions("1.0.0", "2.0.0"));
    }

    #[test]
    fn prerelease_minor_differences_incompatible() {
        assert!(!resolve_versions("0.2.0", "0.1.0"));
        assert!(!resolve_versions("0.2.0", "0.3.0"));
        assert!(resolve_versions("0.2.1", "0.2.0"));
    }

    #[test]
    fn peer_resolution_uses_sdk_version() {
        assert!(resolve_peer_version(version_string(), "source"));
        let (major, minor, patch) = version_info();
        let bumped_patch = format!("{major}.{minor}.{}", patch + 1);
        assert!(resolve_peer_version(&bumped_patch, "source"));
        let bumped_major = format!("{}.{minor}.{patch}", major + 1);
        assert!(!resolve_peer_version(&bumped_major, "source"));
    }
}
