//! Canonicalizes a raw query string into the form used for exact-match cache
//! keys: NFC-normalized, lowercased, trimmed, internal whitespace collapsed,
//! and punctuation stripped. Two queries that normalize to the same string
//! are treated as the same cache entry.

use unicode_normalization::UnicodeNormalization;

/// Returns the empty string if nothing but whitespace/punctuation survives
/// normalization — callers must treat that as "do not cache" rather than
/// storing under an empty key.
pub fn normalize_query(raw: &str) -> String {
    let nfc: String = raw.nfc().collect();
    let lowered = nfc.to_lowercase();

    let mut out = String::with_capacity(lowered.len());
    let mut last_was_space = false;
    for ch in lowered.chars() {
        if ch.is_whitespace() {
            if !out.is_empty() && !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
            continue;
        }
        if is_strippable_punctuation(ch) {
            continue;
        }
        out.push(ch);
        last_was_space = false;
    }

    out.trim_end().to_string()
}

fn is_strippable_punctuation(ch: char) -> bool {
    matches!(
        ch,
        '.' | ',' | '!' | '?' | ';' | ':' | '"' | '\'' | '`' | '(' | ')' | '[' | ']' | '{' | '}'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_lowercases() {
        assert_eq!(normalize_query("  What   IS   Rust?  "), "what is rust");
    }

    #[test]
    fn strips_common_punctuation() {
        assert_eq!(normalize_query("Hello, world!"), "hello world");
    }

    #[test]
    fn whitespace_only_input_normalizes_to_empty() {
        assert_eq!(normalize_query("   \t\n  "), "");
    }

    #[test]
    fn punctuation_only_input_normalizes_to_empty() {
        assert_eq!(normalize_query("???!!!"), "");
    }

    #[test]
    fn distinct_queries_remain_distinct() {
        assert_ne!(normalize_query("rust cache"), normalize_query("cache rust"));
    }

    #[test]
    fn nfc_composes_combining_characters() {
        // "e" + combining acute accent vs precomposed "é" should normalize
        // to the same string.
        let decomposed = "cafe\u{0301}";
        let precomposed = "café";
        assert_eq!(normalize_query(decomposed), normalize_query(precomposed));
    }
}
