//! Small string and timing helpers shared by the agent, observation and
//! provider layers.

use std::time::Instant;

/// Truncate to at most `max_chars` characters, appending "..." if anything
/// was cut. Counts characters, not bytes, so multi-byte text never panics.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", s[..idx].trim_end()),
        None => s.to_string(),
    }
}

/// Greatest valid UTF-8 char boundary at or below `index`.
pub fn floor_utf8_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Cap a string at `max_bytes` without splitting a character.
pub fn truncate_bytes(s: &str, max_bytes: usize) -> &str {
    &s[..floor_utf8_char_boundary(s, max_bytes)]
}

/// Collapse runs of whitespace (including newlines) into single spaces.
/// Page text scraped from the DOM is full of layout whitespace.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Milliseconds since `start`, saturating.
pub fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
