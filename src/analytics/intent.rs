//! Deterministic fallback intent classifier.
//!
//! Runs when the analytics collaborator fails or returns something
//! unparseable. Pattern tables are evaluated in order and the first
//! match wins; specificity depends on that order (e.g. "unsubscribe"
//! must hit cancellation before "subscribe" can hit purchase).

/// Ordered intent patterns. First match wins.
const INTENT_PATTERNS: &[(&str, &[&str])] = &[
    (
        "complaint",
        &[
            "complain",
            "terrible",
            "worst",
            "awful",
            "unacceptable",
            "disappointed",
            "angry",
            "furious",
            "hate",
            "never work",
        ],
    ),
    (
        "cancellation",
        &[
            "cancel",
            "unsubscribe",
            "terminate",
            "end my",
            "stop my",
            "close my account",
        ],
    ),
    (
        "purchase",
        &[
            "buy",
            "purchase",
            "order",
            "pricing",
            "cost",
            "how much",
            "subscribe",
            "sign up",
        ],
    ),
    (
        "support",
        &[
            "help", "issue", "problem", "not working", "broken", "fix", "trouble", "error",
            "stuck",
        ],
    ),
    (
        "inquiry",
        &[
            "what is",
            "how do",
            "where can",
            "when will",
            "tell me about",
            "information",
            "question",
            "wondering",
        ],
    ),
    (
        "feedback",
        &[
            "suggestion",
            "feedback",
            "improve",
            "recommend",
            "better if",
            "would be nice",
        ],
    ),
];

/// Transcript length above which an unmatched conversation still counts
/// as a generic inquiry rather than unknown.
const INQUIRY_FLOOR: usize = 20;

/// Classify the customer's intent from concatenated transcript text.
pub fn classify(text: &str) -> &'static str {
    let lowered = text.to_lowercase();
    for (intent, keywords) in INTENT_PATTERNS {
        if keywords.iter().any(|kw| lowered.contains(kw)) {
            return intent;
        }
    }
    if text.len() > INQUIRY_FLOOR {
        "inquiry"
    } else {
        "unknown"
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complaint_wins_over_later_patterns() {
        // "terrible" (complaint) and "help" (support) both present;
        // complaint is evaluated first.
        assert_eq!(classify("this is terrible, I need help"), "complaint");
    }

    #[test]
    fn unsubscribe_is_cancellation_not_purchase() {
        assert_eq!(classify("I want to unsubscribe right now"), "cancellation");
    }

    #[test]
    fn purchase_keywords() {
        assert_eq!(classify("how much does the premium plan cost"), "purchase");
        assert_eq!(classify("I would like to sign up"), "purchase");
    }

    #[test]
    fn support_keywords() {
        assert_eq!(classify("the app is not working on my phone"), "support");
        assert_eq!(classify("I am stuck on the login screen"), "support");
    }

    #[test]
    fn inquiry_keywords() {
        assert_eq!(classify("tell me about your business hours"), "inquiry");
        assert_eq!(classify("I was wondering if you ship abroad"), "inquiry");
    }

    #[test]
    fn feedback_keywords() {
        assert_eq!(
            classify("just a suggestion, the menu could be clearer"),
            "feedback"
        );
        assert_eq!(classify("it would be nice to have dark mode"), "feedback");
    }

    #[test]
    fn case_insensitive() {
        assert_eq!(classify("CANCEL MY PLAN"), "cancellation");
    }

    #[test]
    fn long_unmatched_text_is_inquiry() {
        assert_eq!(
            classify("the weather was lovely on my street today"),
            "inquiry"
        );
    }

    #[test]
    fn short_unmatched_text_is_unknown() {
        assert_eq!(classify("hello there"), "unknown");
        assert_eq!(classify(""), "unknown");
    }
}
