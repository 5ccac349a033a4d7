//! UTF-8 safe truncation for display strings.

/// Largest index `<= max_bytes` that does not split a codepoint.
fn char_floor(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    (0..=max_bytes)
        .rev()
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(0)
}

/// Borrow at most `max_bytes` of `s`, never splitting a UTF-8 codepoint.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    &s[..char_floor(s, max_bytes)]
}
