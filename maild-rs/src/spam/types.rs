/// Verdict produced by the classifier for one ingress message.
#[derive(Debug, Clone, PartialEq)]
pub struct SpamVerdict {
    pub is_spam: bool,
    pub score: f64,
    pub matched_keywords: Vec<String>,
}

impl SpamVerdict {
    pub fn clean() -> Self {
        Self {
            is_spam: false,
            score: 0.0,
            matched_keywords: Vec::new(),
        }
    }
}
