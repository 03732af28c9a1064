//! Intent/credential extraction (§4.9): turns one finalized user turn into
//! the memory patch the gateway sends the agent. Spoken numbers ("seven two
//! four") are normalized to digit runs before the account/sort-code regexes
//! run, since the voice model's transcript is plain text, not digits.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

static NUMBER_WORDS: Lazy<std::collections::HashMap<&'static str, &'static str>> = Lazy::new(|| {
    std::collections::HashMap::from([
        ("zero", "0"),
        ("oh", "0"),
        ("one", "1"),
        ("two", "2"),
        ("three", "3"),
        ("four", "4"),
        ("five", "5"),
        ("six", "6"),
        ("seven", "7"),
        ("eight", "8"),
        ("nine", "9"),
    ])
});

static EIGHT_DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{8}\b").unwrap());
static SIX_DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{6}\b").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    CheckBalance,
    CheckTransactions,
    Dispute,
    Mortgage,
    Investigation,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::CheckBalance => "check_balance",
            Intent::CheckTransactions => "check_transactions",
            Intent::Dispute => "dispute",
            Intent::Mortgage => "mortgage",
            Intent::Investigation => "investigation",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedFields {
    pub account: Option<String>,
    pub sort_code: Option<String>,
    pub intent: Option<Intent>,
}

/// Collapses runs of spoken-number words (and already-numeric tokens split
/// by spaces, e.g. "12 34 56") into contiguous digit strings, leaving
/// everything else untouched.
pub fn normalize_spoken_digits(text: &str) -> String {
    let mut result = String::new();
    let mut prev_was_digits = false;

    for raw_token in text.split_whitespace() {
        let cleaned: String = raw_token.chars().filter(|c| c.is_alphanumeric()).collect();
        let digits = NUMBER_WORDS
            .get(cleaned.to_lowercase().as_str())
            .map(|d| d.to_string())
            .or_else(|| (!cleaned.is_empty() && cleaned.chars().all(|c| c.is_ascii_digit())).then_some(cleaned));

        match digits {
            Some(d) => {
                if !prev_was_digits && !result.is_empty() {
                    result.push(' ');
                }
                result.push_str(&d);
                prev_was_digits = true;
            }
            None => {
                if !result.is_empty() {
                    result.push(' ');
                }
                result.push_str(raw_token);
                prev_was_digits = false;
            }
        }
    }

    result
}

pub fn extract_account_number(text: &str) -> Option<String> {
    let normalized = normalize_spoken_digits(text);
    EIGHT_DIGIT_RUN.find(&normalized).map(|m| m.as_str().to_string())
}

pub fn extract_sort_code(text: &str) -> Option<String> {
    let normalized = normalize_spoken_digits(text);
    SIX_DIGIT_RUN.find(&normalized).map(|m| m.as_str().to_string())
}

pub fn extract_intent(text: &str) -> Option<Intent> {
    let lower = text.to_lowercase();
    if lower.contains("balance") {
        Some(Intent::CheckBalance)
    } else if lower.contains("transaction") || lower.contains("statement") {
        Some(Intent::CheckTransactions)
    } else if lower.contains("dispute") || lower.contains("chargeback") || lower.contains("fraud") {
        Some(Intent::Dispute)
    } else if lower.contains("mortgage") {
        Some(Intent::Mortgage)
    } else if lower.contains("investigat") {
        Some(Intent::Investigation)
    } else {
        None
    }
}

pub fn extract(text: &str) -> ExtractedFields {
    ExtractedFields {
        account: extract_account_number(text),
        sort_code: extract_sort_code(text),
        intent: extract_intent(text),
    }
}

/// First non-null wins; a later message only overwrites the existing intent
/// when it resolves to a materially different one (§4.9).
pub fn merge_intent(existing: Option<&str>, new_intent: Option<Intent>) -> Option<String> {
    match (existing, new_intent) {
        (None, Some(i)) => Some(i.as_str().to_string()),
        (Some(e), Some(i)) if e != i.as_str() => Some(i.as_str().to_string()),
        (Some(e), _) => Some(e.to_string()),
        (None, None) => None,
    }
}

/// Builds the `update_memory` patch for one finalized user turn.
pub fn build_memory_patch(extracted: &ExtractedFields, existing_intent: Option<&str>, user_text: &str) -> Map<String, Value> {
    let mut patch = Map::new();
    if let Some(account) = &extracted.account {
        patch.insert("account".into(), json!(account));
    }
    if let Some(sort_code) = &extracted.sort_code {
        patch.insert("sortCode".into(), json!(sort_code));
    }
    if let Some(intent) = merge_intent(existing_intent, extracted.intent) {
        patch.insert("userIntent".into(), json!(intent));
    }
    patch.insert("lastUserMessage".into(), json!(user_text));
    patch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_spoken_digits() {
        let normalized = normalize_spoken_digits("account number seven two four five eight one nine zero please");
        assert!(normalized.contains("72458190"));
    }

    #[test]
    fn normalize_collapses_space_separated_numerals() {
        let normalized = normalize_spoken_digits("sort code 12 34 56");
        assert!(normalized.contains("123456"));
    }

    #[test]
    fn extract_account_number_finds_eight_digit_run() {
        let text = "my account number is seven two four five eight one nine zero";
        assert_eq!(extract_account_number(text).as_deref(), Some("72458190"));
    }

    #[test]
    fn extract_sort_code_does_not_match_inside_eight_digit_run() {
        let text = "account seven two four five eight one nine zero";
        assert_eq!(extract_sort_code(text), None);
    }

    #[test]
    fn extract_sort_code_finds_six_digit_run() {
        let text = "sort code one two three four five six";
        assert_eq!(extract_sort_code(text).as_deref(), Some("123456"));
    }

    #[test]
    fn extract_intent_recognizes_each_enumerated_value() {
        assert_eq!(extract_intent("what's my balance"), Some(Intent::CheckBalance));
        assert_eq!(extract_intent("show my recent transactions"), Some(Intent::CheckTransactions));
        assert_eq!(extract_intent("I want to dispute a charge"), Some(Intent::Dispute));
        assert_eq!(extract_intent("I have a question about my mortgage"), Some(Intent::Mortgage));
        assert_eq!(extract_intent("following up on an investigation"), Some(Intent::Investigation));
        assert_eq!(extract_intent("hello there"), None);
    }

    #[test]
    fn merge_intent_first_non_null_wins() {
        assert_eq!(merge_intent(None, Some(Intent::CheckBalance)), Some("check_balance".to_string()));
    }

    #[test]
    fn merge_intent_keeps_existing_when_new_is_same() {
        assert_eq!(
            merge_intent(Some("check_balance"), Some(Intent::CheckBalance)),
            Some("check_balance".to_string())
        );
    }

    #[test]
    fn merge_intent_overwrites_on_material_difference() {
        assert_eq!(merge_intent(Some("check_balance"), Some(Intent::Dispute)), Some("dispute".to_string()));
    }

    #[test]
    fn merge_intent_keeps_existing_when_new_is_none() {
        assert_eq!(merge_intent(Some("check_balance"), None), Some("check_balance".to_string()));
    }

    #[test]
    fn build_memory_patch_always_sets_last_user_message() {
        let patch = build_memory_patch(&ExtractedFields::default(), None, "hello");
        assert_eq!(patch.get("lastUserMessage"), Some(&json!("hello")));
        assert!(patch.get("account").is_none());
    }
}
