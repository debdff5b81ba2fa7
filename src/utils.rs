//! Utility functions for the M3U validator
//!
//! - `utils::url` for URL parsing, manifest detection and log-safe URLs
//! - `utils::logo` for logo host trust decisions during channel merges

pub mod logo;
pub mod url;

/// Truncate a string to at most `max_chars` characters, respecting char boundaries
pub fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("ab", 3), "ab");
        assert_eq!(truncate_chars("中央电视台综合频道", 4), "中央电视");
    }
}
