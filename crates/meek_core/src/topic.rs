//! MQTT-style topic pattern matching: `+` matches exactly one level,
//! `#` matches any remaining levels and is only valid as the final segment.

pub fn is_wildcard(pattern: &str) -> bool {
    pattern.contains('+') || pattern.contains('#')
}

pub fn matches(pattern: &str, topic: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    for (i, pp) in pattern_parts.iter().enumerate() {
        if *pp == "#" {
            // `#` must be terminal; it absorbs the rest of the topic.
            return i == pattern_parts.len() - 1;
        }
        let Some(tp) = topic_parts.get(i) else {
            return false;
        };
        if *pp != "+" && pp != tp {
            return false;
        }
    }
    pattern_parts.len() == topic_parts.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(matches("meek/connection", "meek/connection"));
        assert!(!matches("meek/connection", "meek/connectionz"));
    }

    #[test]
    fn test_plus_matches_single_level() {
        assert!(matches("meek/+/result", "meek/AA:01/result"));
        assert!(!matches("meek/+/result", "meek/AA:01/extra/result"));
        assert!(!matches("meek/+/result", "meek/AA:01/status"));
    }

    #[test]
    fn test_hash_matches_remaining_levels() {
        assert!(matches("meek/#", "meek/AA:01/result"));
        assert!(matches("meek/#", "meek/system/broadcast"));
        assert!(!matches("meek/#", "other/system/broadcast"));
    }

    #[test]
    fn test_hash_must_be_terminal() {
        assert!(!matches("meek/#/result", "meek/AA:01/result"));
    }

    #[test]
    fn test_plus_and_literal_mix() {
        assert!(matches("meek/+/status", "meek/BB:02/status"));
        assert!(!matches("meek/+/status", "meek/status"));
    }

    #[test]
    fn test_pattern_longer_than_topic() {
        assert!(!matches("meek/a/b", "meek/a"));
    }
}
