//! MQTT topic filter matching
//!
//! Standard wildcard semantics: `+` matches exactly one level, `#` matches
//! the remainder and is only valid as the final level. Runners bound to an
//! MQTT rule filter with this even when the broker delivered the message
//! because of a broader subscription.

/// Check whether a concrete topic matches a subscription pattern.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            // A multi-level wildcard also matches the parent level itself.
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(expected), Some(level)) if expected == level => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
