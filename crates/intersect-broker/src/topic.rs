// SPDX-License-Identifier: MIT OR Apache-2.0
//! Topic-pattern matching and AMQP routing-key translation.
//!
//! Patterns use MQTT syntax: `+` matches exactly one level, a trailing `#`
//! matches the remaining levels (including none). The same patterns are
//! translated to AMQP topic-exchange bindings so wildcard behavior is
//! uniform across backends.

/// `true` when `topic` matches `pattern`.
#[must_use]
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segments = pattern.split('/').peekable();
    let mut topic_segments = topic.split('/');

    loop {
        match (pattern_segments.next(), topic_segments.next()) {
            (Some("#"), _) => return pattern_segments.peek().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// `true` when `pattern` is well-formed: wildcards occupy whole segments
/// and `#` only appears as the final segment.
#[must_use]
pub fn valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let segments: Vec<&str> = pattern.split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "#" => {
                if i != segments.len() - 1 {
                    return false;
                }
            }
            "+" => {}
            s if s.contains('#') || s.contains('+') => return false,
            _ => {}
        }
    }
    true
}

/// Translate a concrete topic to an AMQP routing key (`/` → `.`).
#[must_use]
pub fn to_amqp_routing_key(topic: &str) -> String {
    topic.replace('/', ".")
}

/// Translate a subscription pattern to an AMQP binding key
/// (`/` → `.`, `+` → `*`; `#` is shared syntax).
#[must_use]
pub fn to_amqp_binding_key(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|segment| match segment {
            "+" => "*",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Translate an AMQP routing key back to a topic (`.` → `/`).
#[must_use]
pub fn from_amqp_routing_key(key: &str) -> String {
    key.replace('.', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b/x"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(topic_matches("+/b/c", "a/b/c"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/c"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/#", "a/b"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("a/#", "b/a"));
    }

    #[test]
    fn combined_wildcards() {
        assert!(topic_matches("o/f/s/-/svc/events/+/+", "o/f/s/-/svc/events/Cap/ping"));
        assert!(!topic_matches("o/f/s/-/svc/events/+/+", "o/f/s/-/svc/events/Cap"));
        assert!(topic_matches("o/f/s/+/svc/#", "o/f/s/sub/svc/userspace"));
    }

    #[test]
    fn pattern_validity() {
        assert!(valid_pattern("a/+/c"));
        assert!(valid_pattern("a/#"));
        assert!(valid_pattern("#"));
        assert!(!valid_pattern("a/#/c"));
        assert!(!valid_pattern("a/b#"));
        assert!(!valid_pattern("a/b+/c"));
        assert!(!valid_pattern(""));
    }

    #[test]
    fn amqp_translation() {
        assert_eq!(to_amqp_routing_key("a/b/c"), "a.b.c");
        assert_eq!(to_amqp_binding_key("a/+/c"), "a.*.c");
        assert_eq!(to_amqp_binding_key("a/#"), "a.#");
        assert_eq!(from_amqp_routing_key("a.b.c"), "a/b/c");
    }
}
