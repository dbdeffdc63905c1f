//! PII anonymization for the ANONYMIZED view
//!
//! Replacement is deterministic: the same input always yields the same
//! output, so span offsets computed over the anonymized view stay valid.

use crate::error::{Error, Result};
use regex::Regex;

/// A single anonymization rule
#[derive(Debug, Clone)]
pub struct AnonymizationRule {
    /// Rule name
    pub name: String,
    /// Regex pattern
    pub pattern: String,
    /// Replacement token
    pub replacement: String,
}

impl AnonymizationRule {
    fn new(name: &str, pattern: &str, replacement: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
        }
    }
}

/// Default PII rules. Applied in order; card numbers and SSNs run before
/// phone numbers so longer digit groups are not split.
pub fn default_anonymization_rules() -> Vec<AnonymizationRule> {
    vec![
        AnonymizationRule::new(
            "email",
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            "[EMAIL]",
        ),
        AnonymizationRule::new(
            "credit_card",
            r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b",
            "[CREDIT_CARD]",
        ),
        AnonymizationRule::new("ssn", r"\b\d{3}-\d{2}-\d{4}\b", "[SSN]"),
        AnonymizationRule::new(
            "ip_address",
            r"\b(?:\d{1,3}\.){3}\d{1,3}\b",
            "[IP_ADDRESS]",
        ),
        AnonymizationRule::new(
            "date",
            r"\b\d{1,2}[/-]\d{1,2}[/-]\d{2,4}\b",
            "[DATE]",
        ),
        AnonymizationRule::new(
            "phone",
            r"(?:\+?1[-.\s]?)?(?:\(\d{3}\)|\b\d{3})[-.\s]?\d{3}[-.\s]?\d{4}\b",
            "[PHONE]",
        ),
    ]
}

struct CompiledRule {
    pattern: Regex,
    replacement: String,
}

/// Regex-based PII anonymizer
pub struct Anonymizer {
    rules: Vec<CompiledRule>,
}

impl Anonymizer {
    /// Compile the given rules
    pub fn new(rules: Vec<AnonymizationRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let pattern = Regex::new(&rule.pattern).map_err(|e| {
                    Error::Config(format!(
                        "Invalid regex pattern for anonymization rule '{}': {}",
                        rule.name, e
                    ))
                })?;
                Ok(CompiledRule {
                    pattern,
                    replacement: rule.replacement,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules })
    }

    /// Anonymizer with [`default_anonymization_rules`]
    pub fn with_defaults() -> Result<Self> {
        Self::new(default_anonymization_rules())
    }

    /// Replace every PII match with its token
    pub fn anonymize(&self, text: &str) -> String {
        self.rules.iter().fold(text.to_string(), |acc, rule| {
            rule.pattern
                .replace_all(&acc, rule.replacement.as_str())
                .into_owned()
        })
    }

    /// Whether any rule matches
    pub fn contains_pii(&self, text: &str) -> bool {
        self.rules.iter().any(|rule| rule.pattern.is_match(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anonymizer() -> Anonymizer {
        Anonymizer::with_defaults().unwrap()
    }

    #[test]
    fn test_anonymize_email_and_ssn() {
        let out = anonymizer().anonymize("Mail jane.doe@example.com, SSN 123-45-6789.");
        assert_eq!(out, "Mail [EMAIL], SSN [SSN].");
    }

    #[test]
    fn test_anonymize_card_before_phone() {
        let out = anonymizer().anonymize("Card 4111-1111-1111-1111 ok");
        assert_eq!(out, "Card [CREDIT_CARD] ok");
    }

    #[test]
    fn test_anonymize_phone_ip_date() {
        let out = anonymizer().anonymize("Call 555-123-4567 from 10.0.0.1 on 12/25/2020");
        assert_eq!(out, "Call [PHONE] from [IP_ADDRESS] on [DATE]");
    }

    #[test]
    fn test_plain_text_untouched() {
        let text = "Blessed are the meek, for they shall inherit the earth.";
        assert_eq!(anonymizer().anonymize(text), text);
        assert!(!anonymizer().contains_pii(text));
    }

    #[test]
    fn test_deterministic() {
        let a = anonymizer();
        let text = "write to a@b.org or b@c.org";
        assert_eq!(a.anonymize(text), a.anonymize(text));
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let result = Anonymizer::new(vec![AnonymizationRule::new("bad", "(", "x")]);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
