// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event-name pattern matching.
//!
//! Patterns are colon-delimited like event names; `*` matches exactly one
//! segment. The bare pattern `"*"` matches every event regardless of
//! segment count.

/// Check whether `event` matches `pattern`.
pub fn matches_pattern(event: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let mut pattern_parts = pattern.split(':');
    let mut event_parts = event.split(':');

    loop {
        match (pattern_parts.next(), event_parts.next()) {
            (None, None) => return true,
            (Some(p), Some(e)) => {
                if p != "*" && p != e {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// True when the string contains a wildcard segment and must go through
/// pattern matching rather than exact lookup.
pub fn is_pattern(name: &str) -> bool {
    name == "*" || name.split(':').any(|part| part == "*")
}

#[cfg(test)]
#[path = "pattern_tests.rs"]
mod tests;
