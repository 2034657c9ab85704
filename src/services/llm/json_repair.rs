//! JSON repair for providers without server-side schema enforcement.
//!
//! Three stages: strict parse, fenced code block extraction, then the
//! first balanced `{...}` span.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").expect("static regex"));

pub fn extract_json(text: &str) -> Option<Value> {
    // 1. Strict parse
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }

    // 2. Fenced code blocks
    for capture in FENCED_BLOCK.captures_iter(text) {
        if let Ok(value) = serde_json::from_str::<Value>(&capture[1]) {
            if value.is_object() || value.is_array() {
                return Some(value);
            }
        }
    }

    // 3. First balanced brace span
    balanced_object_span(text).and_then(|span| serde_json::from_str(span).ok())
}

/// Find the first `{` and scan for its matching close brace, honoring
/// string literals and escapes.
fn balanced_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            },
            _ => {},
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strict_parse() {
        let result = extract_json(r#"{"name": "Kim"}"#).unwrap();
        assert_eq!(result, json!({"name": "Kim"}));
    }

    #[test]
    fn test_fenced_block() {
        let text = "Here is the data:\n```json\n{\"name\": \"Kim\"}\n```\nDone.";
        assert_eq!(extract_json(text).unwrap(), json!({"name": "Kim"}));
    }

    #[test]
    fn test_fenced_block_without_language() {
        let text = "```\n{\"ok\": true}\n```";
        assert_eq!(extract_json(text).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn test_balanced_span_with_prose() {
        let text = r#"Sure! The extracted result is {"name": "Kim", "skills": ["Rust"]} as requested."#;
        assert_eq!(extract_json(text).unwrap(), json!({"name": "Kim", "skills": ["Rust"]}));
    }

    #[test]
    fn test_nested_braces_and_strings() {
        let text = r#"noise {"a": {"b": "close } brace in string"}, "c": 1} trailing"#;
        let result = extract_json(text).unwrap();
        assert_eq!(result["a"]["b"], json!("close } brace in string"));
        assert_eq!(result["c"], json!(1));
    }

    #[test]
    fn test_unparseable_returns_none() {
        assert!(extract_json("no json here at all").is_none());
        assert!(extract_json("{broken").is_none());
    }
}
