//! Transient-versus-permanent failure classification.

use serde::{Deserialize, Serialize};

/// Substrings that mark a failure as transient.
pub const DEFAULT_TRANSIENT_PATTERNS: &[&str] = &[
    "network",
    "timeout",
    "connection",
    "rate limit",
    "rate-limit",
    "unavailable",
    "temporary",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// Likely to succeed if retried later.
    Transient,
    Permanent,
}

/// Case-insensitive substring matcher over a configurable pattern list.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    patterns: Vec<String>,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSIENT_PATTERNS.iter().copied())
    }
}

impl FailureClassifier {
    /// Empty patterns are ignored.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// The first pattern found in `message`, if any.
    pub fn matched_pattern(&self, message: &str) -> Option<&str> {
        let haystack = message.to_lowercase();
        self.patterns
            .iter()
            .find(|p| haystack.contains(p.as_str()))
            .map(String::as_str)
    }

    pub fn classify(&self, message: &str) -> FailureClass {
        if self.matched_pattern(message).is_some() {
            FailureClass::Transient
        } else {
            FailureClass::Permanent
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_patterns_are_case_insensitive() {
        let classifier = FailureClassifier::default();

        assert_eq!(classifier.classify("Connection reset by peer"), FailureClass::Transient);
        assert_eq!(classifier.classify("request TIMEOUT after 30s"), FailureClass::Transient);
        assert_eq!(classifier.classify("429 Rate-Limit exceeded"), FailureClass::Transient);
        assert_eq!(classifier.classify("Service Unavailable"), FailureClass::Transient);
        assert_eq!(classifier.classify("syntax error near line 4"), FailureClass::Permanent);
    }

    #[test]
    fn test_matched_pattern() {
        let classifier = FailureClassifier::default();
        assert_eq!(classifier.matched_pattern("temporary failure in name resolution"), Some("temporary"));
        assert_eq!(classifier.matched_pattern("assertion failed"), None);
    }

    #[test]
    fn test_custom_patterns() {
        let classifier = FailureClassifier::new(["ECONNREFUSED", "  ", "lock held"]);
        assert_eq!(classifier.patterns().len(), 2);
        assert_eq!(classifier.classify("connect ECONNREFUSED 127.0.0.1"), FailureClass::Transient);
        assert_eq!(classifier.classify("network is down"), FailureClass::Permanent);
    }
}
