//! One-line run summaries for the history table.

/// Maximum summary length in characters, ellipsis included.
pub const MAX_SUMMARY_CHARS: usize = 200;

/// First non-blank line of `text`, trimmed and capped at
/// [`MAX_SUMMARY_CHARS`] characters (197 + `...` when cut).
///
/// Returns `None` when `text` has no visible content.
pub fn extract_summary(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;

    // Count characters, not bytes, so multi-byte text is never split.
    if line.chars().count() <= MAX_SUMMARY_CHARS {
        return Some(line.to_string());
    }
    let head: String = line.chars().take(MAX_SUMMARY_CHARS - 3).collect();
    Some(format!("{head}..."))
}
