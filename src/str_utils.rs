/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Splits `s` into consecutive slices of at most `max_chars` characters each.
/// Never splits inside a UTF-8 sequence.
pub fn chunk_chars(s: &str, max_chars: usize) -> Vec<&str> {
    if max_chars == 0 {
        return vec![s];
    }
    let mut chunks = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        let head = prefix_chars(rest, max_chars);
        chunks.push(head);
        rest = &rest[head.len()..];
    }
    chunks
}

/// Returns the part of `full` that follows `delivered`, if `full` starts with it.
pub fn remainder_after<'a>(full: &'a str, delivered: &str) -> Option<&'a str> {
    if delivered.is_empty() {
        return None;
    }
    full.strip_prefix(delivered)
}
