use serde_json::Value;

/// Decides whether a sampled field carries personal data. Implementations
/// get the field path and, for scalars, the value; they return the reason
/// when the field must be redacted.
pub trait PiiDetector: Send + Sync {
    fn detect(&self, field_path: &str, value: Option<&Value>) -> Option<String>;
}

const NAME_PATTERNS: &[(&str, &str)] = &[
    ("email", "email"),
    ("phone", "phone number"),
    ("mobile", "phone number"),
    ("ssn", "social security number"),
    ("socialsecurity", "social security number"),
    ("password", "credential"),
    ("passwd", "credential"),
    ("secret", "credential"),
    ("token", "credential"),
    ("apikey", "credential"),
    ("ipaddress", "ip address"),
    ("address", "postal address"),
    ("street", "postal address"),
    ("birth", "date of birth"),
    ("dob", "date of birth"),
    ("creditcard", "payment card"),
    ("cardnumber", "payment card"),
    ("iban", "bank account"),
    ("passport", "passport number"),
];

/// Field-name patterns plus a few value shapes (email, card number, SSN).
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPiiDetector;

impl PiiDetector for DefaultPiiDetector {
    fn detect(&self, field_path: &str, value: Option<&Value>) -> Option<String> {
        // Leaf first, then enclosing objects: `Address.City` is postal data too.
        for (depth, segment) in field_path.rsplit('.').enumerate() {
            let Some(label) = name_pattern(segment) else {
                continue;
            };
            return Some(if depth == 0 {
                format!("field name suggests {label}")
            } else {
                format!("enclosing field {} suggests {label}", segment.trim_end_matches("[]"))
            });
        }
        let text = value?.as_str()?;
        if looks_like_email(text) {
            return Some("value looks like an email address".to_string());
        }
        if looks_like_ssn(text) {
            return Some("value looks like a social security number".to_string());
        }
        if looks_like_card_number(text) {
            return Some("value looks like a payment card number".to_string());
        }
        None
    }
}

fn name_pattern(segment: &str) -> Option<&'static str> {
    let normalized: String = segment
        .trim_end_matches("[]")
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_lowercase())
        .collect();
    NAME_PATTERNS
        .iter()
        .find(|(pattern, _)| normalized.contains(pattern))
        .map(|(_, label)| *label)
}

pub fn looks_like_email(text: &str) -> bool {
    if text.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = text.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

fn looks_like_ssn(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() == 11
        && bytes.iter().enumerate().all(|(idx, b)| match idx {
            3 | 6 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

fn looks_like_card_number(text: &str) -> bool {
    if !text
        .chars()
        .all(|ch| ch.is_ascii_digit() || ch == ' ' || ch == '-')
    {
        return false;
    }
    let digits: Vec<u32> = text.chars().filter_map(|ch| ch.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    luhn(&digits)
}

fn luhn(digits: &[u32]) -> bool {
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(idx, &digit)| {
            if idx % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                digit
            }
        })
        .sum();
    sum % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flags_by_field_name() {
        let detector = DefaultPiiDetector;
        assert!(detector.detect("Email", None).is_some());
        assert!(detector.detect("contact.phone_number", None).is_some());
        assert!(detector.detect("PasswordHash", None).is_some());
        assert!(detector.detect("Name", None).is_none());
        assert!(detector.detect("Status", Some(&json!("active"))).is_none());
    }

    #[test]
    fn enclosing_objects_taint_their_fields() {
        let detector = DefaultPiiDetector;
        let reason = detector.detect("Address.City", Some(&json!("Oslo"))).unwrap();
        assert!(reason.contains("Address"));
        assert!(detector.detect("Contacts[].Phone", None).is_some());
        assert!(detector.detect("BillingAddress[].Zip", None).is_some());
        assert!(detector.detect("Shipping.Carrier", Some(&json!("dhl"))).is_none());
    }

    #[test]
    fn flags_by_value_shape() {
        let detector = DefaultPiiDetector;
        assert!(detector.detect("contact", Some(&json!("a@example.com"))).is_some());
        assert!(detector.detect("tax", Some(&json!("123-45-6789"))).is_some());
        assert!(detector.detect("pan", Some(&json!("4111 1111 1111 1111"))).is_some());
        assert!(detector.detect("sku", Some(&json!("1234567890123"))).is_none());
    }

    #[test]
    fn email_shape() {
        assert!(looks_like_email("ana@shop.io"));
        assert!(!looks_like_email("ana@localhost"));
        assert!(!looks_like_email("not an@email.com"));
    }
}
