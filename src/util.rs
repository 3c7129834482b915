//! Small shared helpers used across the server.

use rand::Rng;

/// Generate `n` random bytes and hex-encode them.
///
/// Used for request IDs and bearer tokens; `rand::rng()` is a CSPRNG.
pub fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Collapse all runs of whitespace (including newlines) into single spaces.
///
/// Tool parameters are rendered on one line in terminal UIs; multi-line
/// JSON arguments would otherwise break the layout.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate `input` to at most `max_chars`, appending an ellipsis when cut.
pub fn truncate_with_ellipsis(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let truncated: String = input.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{truncated}…")
}
