//! Key matching.
//!
//! A pattern is one of:
//! - an exact key (`user:login`)
//! - the global wildcard `*`, matching every key
//! - a prefix wildcard `segment:*`, matching any key `segment:<anything>`
//!
//! Both sides are split on the first `:` only. The rest of a prefix
//! wildcard must be exactly `*`, so `a:*` matches `a:b:c` while `a:b:*`
//! matches nothing but the literal key `a:b:*`. A `*` anywhere else carries
//! no meaning.

/// Segment delimiter.
pub const DELIMITER: char = ':';

/// Wildcard marker.
pub const WILDCARD: &str = "*";

/// Check if a key matches a pattern.
pub fn matches(key: &str, pattern: &str) -> bool {
    if pattern == key || pattern == WILDCARD {
        return true;
    }

    match (key.split_once(DELIMITER), pattern.split_once(DELIMITER)) {
        (Some((key_head, _)), Some((pattern_head, pattern_rest))) => {
            key_head == pattern_head && pattern_rest == WILDCARD
        }
        _ => false,
    }
}

/// Check if a string carries the wildcard marker and must be expanded
/// against stored keys rather than looked up directly.
pub fn is_pattern(key: &str) -> bool {
    key.contains(WILDCARD)
}
