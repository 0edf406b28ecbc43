//! Pure text heuristics used by the orchestration loop.
//!
//! Kept as free functions so each rule is independently testable and the
//! orchestrator's control flow stays free of pattern-matching noise.

use once_cell::sync::Lazy;
use regex::Regex;

use cartwheel_core::domain::checkout::DeliveryMode;

static ORDER_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{8})\b").expect("order code pattern"));

/// Backend order codes are 8-digit numeric strings; the first one found wins.
pub fn extract_order_code(text: &str) -> Option<String> {
    ORDER_CODE.captures(text).map(|captures| captures[1].to_string())
}

const ORDER_INQUIRY_KEYWORDS: [&str; 3] = ["order", "status", "show"];

/// Whether the message looks like a question about an existing order.
pub fn is_order_inquiry(text: &str) -> bool {
    let normalized = text.to_ascii_lowercase();
    ORDER_INQUIRY_KEYWORDS.iter().any(|keyword| normalized.contains(keyword))
        || extract_order_code(text).is_some()
}

const GREETINGS: [&str; 8] =
    ["hi", "hello", "hey", "good morning", "good afternoon", "good evening", "howdy", "greetings"];

pub fn is_greeting(text: &str) -> bool {
    let normalized = text.trim().to_ascii_lowercase();
    GREETINGS.iter().any(|greeting| {
        normalized == *greeting
            || normalized.starts_with(&format!("{greeting} "))
            || normalized.starts_with(&format!("{greeting},"))
            || normalized.starts_with(&format!("{greeting}!"))
    })
}

const INTERROGATIVES: [&str; 10] =
    ["what", "which", "where", "when", "who", "how", "can", "could", "do", "is"];

pub fn is_interrogative(text: &str) -> bool {
    let normalized = text.trim().to_ascii_lowercase();
    normalized.contains('?')
        || INTERROGATIVES
            .iter()
            .any(|word| normalized.starts_with(&format!("{word} ")))
}

const DOMAIN_KEYWORDS: [&str; 18] = [
    "product", "products", "cart", "basket", "order", "buy", "purchase", "price", "cheap",
    "delivery", "shipping", "checkout", "pay", "payment", "return", "stock", "category", "store",
];

pub fn mentions_domain(text: &str) -> bool {
    let normalized = text.to_ascii_lowercase();
    DOMAIN_KEYWORDS.iter().any(|keyword| normalized.contains(keyword))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicRelevance {
    Relevant,
    OffDomain(&'static str),
    Unclassified,
}

const CODE_GENERATION_MARKERS: [&str; 6] =
    ["write code", "write a script", "generate code", "write me a function", "python", "javascript"];
const APP_CREATION_MARKERS: [&str; 4] =
    ["build an app", "build a website", "create an app", "create a website"];
const RESTRICTED_ADVICE_MARKERS: [&str; 6] = [
    "political",
    "election",
    "medical advice",
    "diagnose",
    "legal advice",
    "lawsuit",
];

/// Permissive topic heuristic: domain keywords, greetings, and questions pass;
/// a fixed list of clearly off-domain intents is rejected; everything else is
/// accepted and left for the model to steer back on topic.
pub fn classify_topic(text: &str) -> TopicRelevance {
    if mentions_domain(text) || is_greeting(text) || is_interrogative(text) {
        return TopicRelevance::Relevant;
    }

    let normalized = text.to_ascii_lowercase();
    if CODE_GENERATION_MARKERS.iter().any(|marker| normalized.contains(marker)) {
        return TopicRelevance::OffDomain("code_generation");
    }
    if APP_CREATION_MARKERS.iter().any(|marker| normalized.contains(marker)) {
        return TopicRelevance::OffDomain("app_creation");
    }
    if RESTRICTED_ADVICE_MARKERS.iter().any(|marker| normalized.contains(marker)) {
        return TopicRelevance::OffDomain("restricted_advice");
    }

    TopicRelevance::Unclassified
}

/// Remaps a model-supplied delivery code to the nearest cached backend code.
///
/// The model often echoes a user-facing label ("standard-net") instead of the
/// backend's opaque code. Resolution order: exact code match, then
/// prefix/substring match on the token before the first separator, then the
/// first cached mode. Returns `None` only when no modes are cached.
pub fn correct_delivery_code(requested: &str, modes: &[DeliveryMode]) -> Option<String> {
    if modes.is_empty() {
        return None;
    }

    if let Some(exact) = modes.iter().find(|mode| mode.code == requested) {
        return Some(exact.code.clone());
    }

    let stem = requested
        .split(['-', '_', ' ', '.'])
        .next()
        .unwrap_or(requested)
        .to_ascii_lowercase();
    if !stem.is_empty() {
        if let Some(matched) = modes.iter().find(|mode| {
            let code = mode.code.to_ascii_lowercase();
            let name = mode.name.to_ascii_lowercase();
            code.starts_with(&stem) || code.contains(&stem) || name.contains(&stem)
        }) {
            return Some(matched.code.clone());
        }
    }

    modes.first().map(|mode| mode.code.clone())
}

#[cfg(test)]
mod tests {
    use cartwheel_core::domain::checkout::DeliveryMode;

    use super::{
        classify_topic, correct_delivery_code, extract_order_code, is_greeting, is_interrogative,
        is_order_inquiry, TopicRelevance,
    };

    fn modes() -> Vec<DeliveryMode> {
        vec![
            DeliveryMode { code: "standard-gross".to_owned(), name: "Standard Delivery".to_owned() },
            DeliveryMode { code: "premium-gross".to_owned(), name: "Premium Delivery".to_owned() },
        ]
    }

    #[test]
    fn extracts_eight_digit_order_codes_only() {
        assert_eq!(extract_order_code("status of order 00012345 please"), Some("00012345".into()));
        assert_eq!(extract_order_code("item 1234 and 123456789"), None);
        assert_eq!(extract_order_code("no code here"), None);
    }

    #[test]
    fn order_inquiry_triggers_on_keywords_or_code() {
        assert!(is_order_inquiry("show my order"));
        assert!(is_order_inquiry("what's the STATUS?"));
        assert!(is_order_inquiry("any news on 00012345"));
        assert!(!is_order_inquiry("I want a new camera"));
    }

    #[test]
    fn greeting_and_question_detection() {
        assert!(is_greeting("Hello there"));
        assert!(is_greeting("hey, I need help"));
        assert!(!is_greeting("they said hello to me"));
        assert!(is_interrogative("what cameras do you have"));
        assert!(is_interrogative("any discounts?"));
        assert!(!is_interrogative("add it to the cart"));
    }

    #[test]
    fn topic_classification_table() {
        struct Case {
            text: &'static str,
            expected: TopicRelevance,
        }

        let cases = vec![
            Case { text: "show me cheap cameras", expected: TopicRelevance::Relevant },
            Case { text: "hi!", expected: TopicRelevance::Relevant },
            Case { text: "how does delivery work", expected: TopicRelevance::Relevant },
            Case {
                text: "write me a function in python",
                expected: TopicRelevance::OffDomain("code_generation"),
            },
            Case {
                text: "build a website for my band",
                expected: TopicRelevance::OffDomain("app_creation"),
            },
            Case {
                text: "give me legal advice about my landlord",
                expected: TopicRelevance::OffDomain("restricted_advice"),
            },
            Case { text: "tell me something nice", expected: TopicRelevance::Unclassified },
        ];

        for case in cases {
            assert_eq!(classify_topic(case.text), case.expected, "text: {}", case.text);
        }
    }

    #[test]
    fn fuzzy_correction_resolves_label_to_backend_code() {
        assert_eq!(
            correct_delivery_code("standard-net", &modes()),
            Some("standard-gross".to_owned())
        );
    }

    #[test]
    fn fuzzy_correction_prefers_exact_match() {
        assert_eq!(
            correct_delivery_code("premium-gross", &modes()),
            Some("premium-gross".to_owned())
        );
    }

    #[test]
    fn fuzzy_correction_falls_back_to_first_cached_mode() {
        assert_eq!(
            correct_delivery_code("overnight-drone", &modes()),
            Some("standard-gross".to_owned())
        );
    }

    #[test]
    fn fuzzy_correction_without_cached_modes_is_a_noop() {
        assert_eq!(correct_delivery_code("standard-net", &[]), None);
    }

    #[test]
    fn fuzzy_correction_matches_display_names_too() {
        let modes = vec![DeliveryMode {
            code: "d1".to_owned(),
            name: "Premium Courier".to_owned(),
        }];
        assert_eq!(correct_delivery_code("premium", &modes), Some("d1".to_owned()));
    }
}
