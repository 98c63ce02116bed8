use std::collections::HashMap;

use opentelemetry::KeyValue;
use regex::Regex;

/// Glob-style matching as used by X-Ray sampling rules: `*` matches any run
/// of characters (including none), `?` matches a single character.
///
/// A pattern of `"*"` matches everything, even absent text. Patterns without
/// metacharacters compare as plain string equality; anything else is
/// compiled to an anchored regex with the literal segments escaped.
pub(crate) fn wildcard_match(text: Option<&str>, pattern: Option<&str>) -> bool {
    let pattern = match pattern {
        Some(pattern) => pattern,
        None => return false,
    };
    if pattern == "*" {
        return true;
    }
    let text = match text {
        Some(text) => text,
        None => return false,
    };
    if pattern.is_empty() {
        return text.is_empty();
    }
    if !pattern.contains(['*', '?']) {
        return pattern == text;
    }
    match Regex::new(&to_regex(pattern)) {
        Ok(regex) => regex.is_match(text),
        Err(_) => false,
    }
}

fn to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    let mut literal = String::new();
    for ch in pattern.chars() {
        match ch {
            '*' | '?' => {
                if !literal.is_empty() {
                    regex.push_str(&regex::escape(&literal));
                    literal.clear();
                }
                regex.push_str(if ch == '*' { ".*" } else { "." });
            }
            _ => literal.push(ch),
        }
    }
    if !literal.is_empty() {
        regex.push_str(&regex::escape(&literal));
    }
    regex.push('$');
    regex
}

/// Returns whether every rule attribute pattern is satisfied by the span
/// attributes. Vacuously true for an empty pattern set; extra span
/// attributes are ignored.
pub(crate) fn attribute_match(
    attributes: &[KeyValue],
    rule_attributes: &HashMap<String, String>,
) -> bool {
    if rule_attributes.is_empty() {
        return true;
    }
    if attributes.len() < rule_attributes.len() {
        return false;
    }

    let mut matched = 0;
    for attribute in attributes {
        if let Some(pattern) = rule_attributes.get(attribute.key.as_str()) {
            if wildcard_match(Some(&attribute.value.as_str()), Some(pattern)) {
                matched += 1;
            }
        }
    }
    matched == rule_attributes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_everything() {
        assert!(wildcard_match(None, Some("*")));
        assert!(wildcard_match(Some(""), Some("*")));
        assert!(wildcard_match(Some("HelloWorld"), Some("*")));
    }

    #[test]
    fn absent_pattern_or_text_never_matches() {
        assert!(!wildcard_match(Some("HelloWorld"), None));
        assert!(!wildcard_match(None, Some("Hello")));
        assert!(!wildcard_match(None, None));
    }

    #[test]
    fn empty_pattern_matches_only_empty_text() {
        assert!(wildcard_match(Some(""), Some("")));
        assert!(!wildcard_match(Some("a"), Some("")));
    }

    #[test]
    fn exact_patterns_compare_literally() {
        assert!(wildcard_match(Some("GET"), Some("GET")));
        assert!(!wildcard_match(Some("GET"), Some("get")));
        // Regex metacharacters in a literal pattern have no special meaning.
        assert!(!wildcard_match(Some("ab"), Some("a.b")));
        assert!(wildcard_match(Some("a.b"), Some("a.b")));
    }

    #[test]
    fn wildcard_patterns() {
        assert!(wildcard_match(Some("HelloWorld"), Some("Hell?W*d")));
        assert!(wildcard_match(Some("HelloWorld"), Some("*o*")));
        assert!(wildcard_match(Some("/api/users/42"), Some("/api/*")));
        assert!(!wildcard_match(Some("/health"), Some("/api/*")));
        assert!(!wildcard_match(Some("HelloWorld"), Some("Hell?W?d")));
    }

    #[test]
    fn literal_segments_are_escaped() {
        assert!(wildcard_match(Some("a.c-d"), Some("a.c-?")));
        assert!(!wildcard_match(Some("abc-d"), Some("a.c-?")));
    }

    #[test]
    fn attribute_match_semantics() {
        let rule_attributes: HashMap<String, String> = [
            ("abc".to_string(), "123".to_string()),
            ("def".to_string(), "4?6".to_string()),
            ("ghi".to_string(), "*89".to_string()),
        ]
        .into_iter()
        .collect();

        let attributes = vec![
            KeyValue::new("abc", "123"),
            KeyValue::new("def", "456"),
            KeyValue::new("ghi", "789"),
            KeyValue::new("extra", "ignored"),
        ];
        assert!(attribute_match(&attributes, &rule_attributes));

        // Fewer span attributes than rule patterns can never satisfy them.
        let attributes = vec![KeyValue::new("abc", "123")];
        assert!(!attribute_match(&attributes, &rule_attributes));

        // A mismatched value fails even with every key present.
        let attributes = vec![
            KeyValue::new("abc", "123"),
            KeyValue::new("def", "456"),
            KeyValue::new("ghi", "777"),
        ];
        assert!(!attribute_match(&attributes, &rule_attributes));

        assert!(attribute_match(&[], &HashMap::new()));
        assert!(!attribute_match(&[], &rule_attributes));
    }

    #[test]
    fn attribute_values_stringify() {
        let rule_attributes: HashMap<String, String> =
            [("retries".to_string(), "3".to_string())].into_iter().collect();
        let attributes = vec![KeyValue::new("retries", 3i64)];
        assert!(attribute_match(&attributes, &rule_attributes));
    }
}
