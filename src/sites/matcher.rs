//! Hostname against domain-pattern matching.
//!
//! Patterns are either an exact hostname or a single-level wildcard `*.suffix`.
//! A wildcard matches any hostname ending in `.suffix` except the bare suffix
//! itself. Deeper wildcards and regular expressions are not supported.

/// Wildcard prefix for domain patterns
pub const WILDCARD_PREFIX: &str = "*.";

/// Check whether `hostname` is served by `pattern`, case-insensitively.
pub fn matches(hostname: &str, pattern: &str) -> bool {
    if pattern.eq_ignore_ascii_case(hostname) {
        return true;
    }

    let Some(suffix) = pattern.strip_prefix(WILDCARD_PREFIX) else {
        return false;
    };

    // hostname must end in ".<suffix>", never be the suffix alone
    if hostname.len() < suffix.len() + 1 {
        return false;
    }
    let split = hostname.len() - suffix.len();
    if !hostname.is_char_boundary(split) {
        return false;
    }
    let (head, tail) = hostname.split_at(split);
    head.ends_with('.') && tail.eq_ignore_ascii_case(suffix)
}

/// Check that a (lowercased) pattern is an exact name or a single-level wildcard.
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    match pattern.strip_prefix(WILDCARD_PREFIX) {
        Some(suffix) => !suffix.is_empty() && !suffix.contains('*') && !suffix.starts_with('.'),
        None => !pattern.contains('*'),
    }
}
