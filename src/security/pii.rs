//! PII scrubbing for payloads that are echoed or logged.
//!
//! Scalars that look like an email, phone number or structured government
//! identifier are replaced whole. Object entries whose key names a sensitive
//! field are replaced regardless of their value.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Replacement for any scrubbed value.
pub const REDACTED: &str = "[REDACTED]";

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("invalid email pattern"));

static PHONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9(][0-9\s().-]{5,}[0-9]$").expect("invalid phone pattern"));

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("invalid date pattern"));

static IDENTIFIERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // US social security number
        r"^\d{3}-\d{2}-\d{4}$",
        // US employer identification number
        r"^\d{2}-\d{7}$",
        // Passport-style letter prefix + digits
        r"^[A-Z]{1,2}\d{6,9}$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid identifier pattern"))
    .collect()
});

/// Field-name fragments, compared after lowercasing and dropping separators.
const SENSITIVE_KEYS: [&str; 8] = [
    "email",
    "phone",
    "ssn",
    "taxid",
    "passport",
    "nationalid",
    "dateofbirth",
    "address",
];

/// Return a copy of `value` with PII replaced by [`REDACTED`].
pub fn scrub(value: &Value) -> Value {
    match value {
        Value::String(s) if is_sensitive_scalar(s) => Value::String(REDACTED.to_string()),
        Value::Array(items) => Value::Array(items.iter().map(scrub).collect()),
        Value::Object(map) => Value::Object(scrub_map(map)),
        other => other.clone(),
    }
}

fn scrub_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| {
            let scrubbed = if is_sensitive_key(key) {
                Value::String(REDACTED.to_string())
            } else {
                scrub(value)
            };
            (key.clone(), scrubbed)
        })
        .collect()
}

pub fn is_sensitive_key(key: &str) -> bool {
    let folded: String = key
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    SENSITIVE_KEYS.iter().any(|fragment| folded.contains(fragment))
}

pub fn is_sensitive_scalar(value: &str) -> bool {
    let value = value.trim();
    EMAIL.is_match(value) || is_phone(value) || IDENTIFIERS.iter().any(|re| re.is_match(value))
}

fn is_phone(value: &str) -> bool {
    if !PHONE.is_match(value) || ISO_DATE.is_match(value) {
        return false;
    }
    let digits = value.chars().filter(char::is_ascii_digit).count();
    (7..=15).contains(&digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sensitive_key_redacted_other_kept() {
        let input = json!({"email": "a@b.com", "note": "call me"});
        assert_eq!(scrub(&input), json!({"email": REDACTED, "note": "call me"}));
    }

    #[test]
    fn test_array_scrubbed_element_wise() {
        let input = json!([
            {"email": "a@b.com", "note": "call me"},
            {"email": "c@d.org", "note": "later"}
        ]);
        assert_eq!(
            scrub(&input),
            json!([
                {"email": REDACTED, "note": "call me"},
                {"email": REDACTED, "note": "later"}
            ])
        );
    }

    #[test]
    fn test_key_match_ignores_case_and_separators() {
        for key in ["Email", "contactEmail", "PHONE_NUMBER", "tax_id", "Tax-ID", "date_of_birth", "homeAddress", "passportNo", "national_id", "ssn"] {
            assert!(is_sensitive_key(key), "{key}");
        }
        for key in ["note", "name", "amount", "jobId"] {
            assert!(!is_sensitive_key(key), "{key}");
        }
    }

    #[test]
    fn test_key_redaction_ignores_value_shape() {
        let input = json!({"address": {"street": "1 Main St", "city": "Kigali"}});
        assert_eq!(scrub(&input), json!({"address": REDACTED}));
    }

    #[test]
    fn test_scalar_patterns() {
        assert!(is_sensitive_scalar("someone@example.com"));
        assert!(is_sensitive_scalar("+250 788 123 456"));
        assert!(is_sensitive_scalar("(555) 123-4567"));
        assert!(is_sensitive_scalar("123-45-6789"));
        assert!(is_sensitive_scalar("12-3456789"));
        assert!(is_sensitive_scalar("X12345678"));

        assert!(!is_sensitive_scalar("call me"));
        assert!(!is_sensitive_scalar("2024-01-31"));
        assert!(!is_sensitive_scalar("42"));
        assert!(!is_sensitive_scalar("not an @ email"));
    }

    #[test]
    fn test_nested_values_under_safe_keys() {
        let input = json!({"notes": ["reach me at x@y.io", "x@y.io"], "count": 3, "ok": true, "none": null});
        assert_eq!(
            scrub(&input),
            json!({"notes": ["reach me at x@y.io", REDACTED], "count": 3, "ok": true, "none": null})
        );
    }
}
