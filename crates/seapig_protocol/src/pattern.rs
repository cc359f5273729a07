//! Subscription patterns.
//!
//! A pattern is an object id that may contain the wildcard token `*`. Every
//! other character matches itself literally; `*` matches any (possibly empty)
//! run of characters. Matching is anchored: a pattern without a wildcard only
//! matches the identical id.

use crate::error::{ProtocolError, ProtocolResult};
use regex::Regex;
use std::fmt;

/// The wildcard token.
pub const WILDCARD: char = '*';

/// A precompiled subscription pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    text: String,
    matcher: Regex,
}

impl Pattern {
    /// Compiles a pattern.
    pub fn new(text: impl Into<String>) -> ProtocolResult<Self> {
        let text = text.into();
        let expression = format!("(?s)^{}$", regex::escape(&text).replace(r"\*", ".*?"));
        let matcher = Regex::new(&expression).map_err(|e| ProtocolError::InvalidPattern {
            pattern: text.clone(),
            message: e.to_string(),
        })?;
        Ok(Self { text, matcher })
    }

    /// Returns true if `text` contains the wildcard token.
    pub fn is_wildcard_text(text: &str) -> bool {
        text.contains(WILDCARD)
    }

    /// Returns true if this pattern contains the wildcard token.
    pub fn is_wildcard(&self) -> bool {
        Self::is_wildcard_text(&self.text)
    }

    /// Tests whether a concrete id belongs to this pattern.
    pub fn matches(&self, id: &str) -> bool {
        self.matcher.is_match(id)
    }

    /// Returns the pattern text.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Pattern {}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wildcard_matches_any_suffix() {
        let pattern = Pattern::new("room-*").unwrap();
        assert!(pattern.is_wildcard());
        assert!(pattern.matches("room-42"));
        assert!(pattern.matches("room-"));
        assert!(pattern.matches("room-a-b-c"));
        assert!(!pattern.matches("room"));
        assert!(!pattern.matches("bedroom-1"));
    }

    #[test]
    fn wildcard_in_the_middle() {
        let pattern = Pattern::new("user:*:profile").unwrap();
        assert!(pattern.matches("user:17:profile"));
        assert!(!pattern.matches("user:17:settings"));
    }

    #[test]
    fn plain_pattern_matches_only_itself() {
        let pattern = Pattern::new("stats").unwrap();
        assert!(!pattern.is_wildcard());
        assert!(pattern.matches("stats"));
        assert!(!pattern.matches("stats-2"));
        assert!(!pattern.matches("my-stats"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let pattern = Pattern::new("a.b+(c)*").unwrap();
        assert!(pattern.matches("a.b+(c)whatever"));
        assert!(!pattern.matches("aXb+(c)whatever"));
        assert!(!pattern.matches("a.bb(c)"));
    }

    #[test]
    fn equality_is_by_text() {
        assert_eq!(Pattern::new("x-*").unwrap(), Pattern::new("x-*").unwrap());
        assert_ne!(Pattern::new("x-*").unwrap(), Pattern::new("y-*").unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn prefix_wildcard_accepts_every_suffix(
            prefix in "[a-z.+?()\\[\\]-]{0,12}",
            suffix in ".{0,16}",
        ) {
            let pattern = Pattern::new(format!("{prefix}*")).unwrap();
            let id = format!("{prefix}{suffix}");
            prop_assert!(pattern.matches(&id));
        }

        #[test]
        fn literal_pattern_is_exact(text in "[^*]{0,16}", other in "[^*]{0,16}") {
            let pattern = Pattern::new(text.clone()).unwrap();
            prop_assert!(pattern.matches(&text));
            prop_assert_eq!(pattern.matches(&other), other == text);
        }
    }
}
