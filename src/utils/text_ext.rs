//! Small text helpers shared across services.

/// Share of non-whitespace characters inside the Hangul syllable block
/// (U+AC00..=U+D7A3). Returns 0.0 for empty input.
pub fn hangul_ratio(text: &str) -> f64 {
    let mut hangul = 0usize;
    let mut total = 0usize;
    for c in text.chars() {
        if c.is_whitespace() {
            continue;
        }
        total += 1;
        if ('\u{AC00}'..='\u{D7A3}').contains(&c) {
            hangul += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    hangul as f64 / total as f64
}

/// Strip every non-digit character.
pub fn normalize_digits(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Truncate on a char boundary to at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hangul_ratio() {
        assert_eq!(hangul_ratio(""), 0.0);
        assert_eq!(hangul_ratio("abcd"), 0.0);
        assert!(hangul_ratio("김철수") > 0.99);
        // Half Hangul, half Latin, whitespace ignored
        let ratio = hangul_ratio("김철수 abc");
        assert!(ratio > 0.49 && ratio < 0.51);
    }

    #[test]
    fn test_normalize_digits() {
        assert_eq!(normalize_digits("010-1234-5678"), "01012345678");
        assert_eq!(normalize_digits("+82 10 1234 5678"), "821012345678");
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("hello", 10), "hello");
        // Multi-byte chars are not split
        assert_eq!(truncate_chars("가나다라", 2), "가나");
    }
}
