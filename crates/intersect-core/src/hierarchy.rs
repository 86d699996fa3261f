// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical `organization.facility.system[.subsystem].service` names.
//!
//! A hierarchy identifies exactly one service on the control plane. It has
//! two renderings: the dotted form used for message addressing, and the
//! slash form used to derive broker topics (a missing subsystem renders as
//! `-` so topics always have five leading segments).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returns `true` if `label` matches `[a-z0-9][a-z0-9-]*`.
#[must_use]
pub fn valid_label(label: &str) -> bool {
    let mut chars = label.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// A hierarchy string failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidIdentity {
    /// The dotted name did not have 4 or 5 labels.
    #[error("hierarchy '{name}' has {count} labels, expected 4 or 5")]
    LabelCount {
        /// The offending name.
        name: String,
        /// Number of labels found.
        count: usize,
    },

    /// One of the labels did not match `[a-z0-9][a-z0-9-]*`.
    #[error("hierarchy label '{label}' (position {position}) is not lowercase alphanumeric")]
    BadLabel {
        /// The offending label.
        label: String,
        /// Zero-indexed position of the label.
        position: usize,
    },
}

/// A fully-qualified service identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Hierarchy {
    /// Root-level organization name.
    pub organization: String,
    /// Facility within the organization.
    pub facility: String,
    /// System within the facility.
    pub system: String,
    /// Optional subsystem within the system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,
    /// The service itself.
    pub service: String,
}

impl Hierarchy {
    /// Construct a hierarchy, validating every label.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidIdentity::BadLabel`] for the first label that does
    /// not match `[a-z0-9][a-z0-9-]*`.
    pub fn new(
        organization: impl Into<String>,
        facility: impl Into<String>,
        system: impl Into<String>,
        subsystem: Option<String>,
        service: impl Into<String>,
    ) -> Result<Self, InvalidIdentity> {
        let hierarchy = Self {
            organization: organization.into(),
            facility: facility.into(),
            system: system.into(),
            subsystem,
            service: service.into(),
        };
        hierarchy.check_labels()?;
        Ok(hierarchy)
    }

    /// Parse the dotted form (`org.facility.system[.subsystem].service`).
    ///
    /// # Errors
    ///
    /// Returns [`InvalidIdentity`] when the label count is not 4 or 5, or
    /// when any label fails the pattern check.
    pub fn parse(name: &str) -> Result<Self, InvalidIdentity> {
        let labels: Vec<&str> = name.split('.').collect();
        let (subsystem, service) = match labels.len() {
            4 => (None, labels[3]),
            5 => (Some(labels[3].to_string()), labels[4]),
            count => {
                return Err(InvalidIdentity::LabelCount {
                    name: name.to_string(),
                    count,
                });
            }
        };
        Self::new(labels[0], labels[1], labels[2], subsystem, service)
    }

    fn check_labels(&self) -> Result<(), InvalidIdentity> {
        let labels = [
            Some(self.organization.as_str()),
            Some(self.facility.as_str()),
            Some(self.system.as_str()),
            self.subsystem.as_deref(),
            Some(self.service.as_str()),
        ];
        for (position, label) in labels.iter().enumerate() {
            if let Some(label) = label {
                if !valid_label(label) {
                    return Err(InvalidIdentity::BadLabel {
                        label: (*label).to_string(),
                        position,
                    });
                }
            }
        }
        Ok(())
    }

    /// The dotted identity form. The subsystem is omitted entirely when absent.
    #[must_use]
    pub fn name(&self) -> String {
        match &self.subsystem {
            Some(subsystem) => format!(
                "{}.{}.{}.{}.{}",
                self.organization, self.facility, self.system, subsystem, self.service
            ),
            None => format!(
                "{}.{}.{}.{}",
                self.organization, self.facility, self.system, self.service
            ),
        }
    }

    /// The slash form used for topic derivation. A missing subsystem renders
    /// as `-` so every topic has five leading segments.
    #[must_use]
    pub fn topic_prefix(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.organization,
            self.facility,
            self.system,
            self.subsystem.as_deref().unwrap_or("-"),
            self.service
        )
    }

    /// Topic this service receives userspace requests on.
    #[must_use]
    pub fn inbox_topic(&self) -> String {
        format!("{}/userspace", self.topic_prefix())
    }

    /// Topic this service receives operation replies on.
    #[must_use]
    pub fn reply_topic(&self) -> String {
        format!("{}/reply", self.topic_prefix())
    }

    /// Topic this service publishes and receives lifecycle messages on.
    #[must_use]
    pub fn lifecycle_topic(&self) -> String {
        format!("{}/lifecycle", self.topic_prefix())
    }

    /// Topic a specific event of a specific capability is published on.
    #[must_use]
    pub fn event_topic(&self, capability_name: &str, event_name: &str) -> String {
        format!("{}/events/{capability_name}/{event_name}", self.topic_prefix())
    }

    /// Wildcard pattern matching every event this service publishes.
    #[must_use]
    pub fn all_events_pattern(&self) -> String {
        format!("{}/events/#", self.topic_prefix())
    }
}

impl std::fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

impl std::str::FromStr for Hierarchy {
    type Err = InvalidIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_four_labels() {
        let h = Hierarchy::parse("org.fac.sys.svc").unwrap();
        assert_eq!(h.subsystem, None);
        assert_eq!(h.name(), "org.fac.sys.svc");
        assert_eq!(h.topic_prefix(), "org/fac/sys/-/svc");
    }

    #[test]
    fn parse_five_labels() {
        let h = Hierarchy::parse("org.fac.sys.sub.svc").unwrap();
        assert_eq!(h.subsystem.as_deref(), Some("sub"));
        assert_eq!(h.topic_prefix(), "org/fac/sys/sub/svc");
    }

    #[test]
    fn rejects_wrong_label_count() {
        assert!(matches!(
            Hierarchy::parse("org.fac.sys"),
            Err(InvalidIdentity::LabelCount { count: 3, .. })
        ));
        assert!(matches!(
            Hierarchy::parse("a.b.c.d.e.f"),
            Err(InvalidIdentity::LabelCount { count: 6, .. })
        ));
    }

    #[test]
    fn rejects_bad_labels() {
        assert!(matches!(
            Hierarchy::parse("Org.fac.sys.svc"),
            Err(InvalidIdentity::BadLabel { position: 0, .. })
        ));
        assert!(matches!(
            Hierarchy::parse("org.no_underscores.sys.svc"),
            Err(InvalidIdentity::BadLabel { position: 1, .. })
        ));
        assert!(matches!(
            Hierarchy::parse("org.fac..svc"),
            Err(InvalidIdentity::BadLabel { position: 2, .. })
        ));
        assert!(matches!(
            Hierarchy::parse("-org.fac.sys.svc"),
            Err(InvalidIdentity::BadLabel { .. })
        ));
    }

    #[test]
    fn hyphenated_labels_allowed() {
        let h = Hierarchy::parse("hello-organization.hello-facility.hello-system.hello-service");
        assert!(h.is_ok());
    }

    #[test]
    fn topic_layout() {
        let h = Hierarchy::parse("o.f.s.sub.svc").unwrap();
        assert_eq!(h.inbox_topic(), "o/f/s/sub/svc/userspace");
        assert_eq!(h.reply_topic(), "o/f/s/sub/svc/reply");
        assert_eq!(h.lifecycle_topic(), "o/f/s/sub/svc/lifecycle");
        assert_eq!(h.event_topic("Cap", "ping"), "o/f/s/sub/svc/events/Cap/ping");
    }
}
