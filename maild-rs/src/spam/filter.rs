//! Keyword-based spam scoring.
//!
//! Deterministic and side-effect free: the same input always yields the
//! same verdict. A keyword hit in the subject weighs 1.5, in the body
//! 1.0; a suspicious sender pattern adds 0.5. Matching is
//! case-insensitive. `is_spam` is `score >= threshold`.

use crate::config::SpamSettings;
use regex::Regex;
use tracing::debug;

use super::types::SpamVerdict;

const SUBJECT_WEIGHT: f64 = 1.5;
const CONTENT_WEIGHT: f64 = 1.0;
const SENDER_WEIGHT: f64 = 0.5;

pub struct KeywordSpamFilter {
    keywords: Vec<String>,
    sender_patterns: Vec<Regex>,
    threshold: f64,
}

impl KeywordSpamFilter {
    pub fn new(settings: &SpamSettings) -> Self {
        let sender_patterns = settings
            .suspicious_senders
            .iter()
            .filter_map(|pattern| match Regex::new(&pattern.to_lowercase()) {
                Ok(re) => Some(re),
                Err(e) => {
                    debug!("Ignoring invalid sender pattern {:?}: {}", pattern, e);
                    None
                }
            })
            .collect();

        Self {
            keywords: settings
                .keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            sender_patterns,
            threshold: settings.threshold,
        }
    }

    /// Score a message from its sender, subject, and plain-text body.
    pub fn analyze(&self, from_addr: &str, subject: &str, content: &str) -> SpamVerdict {
        let from_lower = from_addr.to_lowercase();
        let subject_lower = subject.to_lowercase();
        let content_lower = content.to_lowercase();

        let mut score = 0.0;
        let mut matched = Vec::new();

        for keyword in &self.keywords {
            if subject_lower.contains(keyword.as_str()) {
                score += SUBJECT_WEIGHT;
                matched.push(format!("subject:{}", keyword));
            }
            if content_lower.contains(keyword.as_str()) {
                score += CONTENT_WEIGHT;
                matched.push(format!("content:{}", keyword));
            }
        }

        for pattern in &self.sender_patterns {
            if pattern.is_match(&from_lower) {
                score += SENDER_WEIGHT;
                matched.push(format!("sender:{}", pattern.as_str()));
            }
        }

        SpamVerdict {
            is_spam: score >= self.threshold,
            score,
            matched_keywords: matched,
        }
    }
}

impl Default for KeywordSpamFilter {
    fn default() -> Self {
        Self::new(&SpamSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_message() {
        let filter = KeywordSpamFilter::default();
        let verdict = filter.analyze(
            "alice@test.local",
            "Meeting tomorrow",
            "See you at ten in the usual room.",
        );
        assert!(!verdict.is_spam);
        assert_eq!(verdict.score, 0.0);
        assert!(verdict.matched_keywords.is_empty());
    }

    #[test]
    fn test_spammy_subject() {
        let filter = KeywordSpamFilter::default();
        let verdict = filter.analyze(
            "anyone@anywhere.com",
            "Congratulations winner! Prize lottery!",
            "",
        );
        assert!(verdict.is_spam);
        assert!(verdict.score >= 0.7);
        // winner, prize, and lottery each hit the subject
        assert!(verdict.score >= 4.5 - f64::EPSILON);
    }

    #[test]
    fn test_body_hit_alone_crosses_threshold() {
        let filter = KeywordSpamFilter::default();
        let verdict = filter.analyze("x@y.com", "hello", "claim your free viagra today");
        assert!(verdict.is_spam);
    }

    #[test]
    fn test_suspicious_sender_alone_is_below_threshold() {
        let filter = KeywordSpamFilter::default();
        let verdict = filter.analyze("noreply@shop.example", "order update", "your parcel shipped");
        assert!(!verdict.is_spam);
        assert!((verdict.score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_case_insensitive() {
        let filter = KeywordSpamFilter::default();
        let verdict = filter.analyze("x@y.com", "LOTTERY TIME", "");
        assert!(verdict.is_spam);
    }

    #[test]
    fn test_deterministic() {
        let filter = KeywordSpamFilter::default();
        let a = filter.analyze("x@y.com", "prize", "winner");
        let b = filter.analyze("x@y.com", "prize", "winner");
        assert_eq!(a, b);
    }
}
