//! Small shared helpers used across the gateway.

/// Truncate `input` to at most `max_chars` characters, appending an
/// ellipsis when anything was cut. Operates on char boundaries, not bytes.
pub fn truncate_with_ellipsis(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Compare two strings in constant time to prevent timing side-channels.
///
/// The loop visits `max(len_a, len_b)` positions regardless of where the
/// first mismatch occurs; a length mismatch is folded into the result the
/// same way as a byte mismatch.
pub fn constant_time_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let mut diff = left_bytes.len() ^ right_bytes.len();
    for index in 0..left_bytes.len().max(right_bytes.len()) {
        let l = left_bytes.get(index).copied().unwrap_or(0);
        let r = right_bytes.get(index).copied().unwrap_or(0);
        diff |= usize::from(l ^ r);
    }
    diff == 0
}
