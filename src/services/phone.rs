// services/phone.rs

/// Normalizes raw phone input into E.164, or rejects it.
pub trait PhoneValidator: Send + Sync {
    fn validate(&self, raw: &str) -> Option<String>;
}

/// Accepts Kenyan mobile numbers only (07xx/01xx prefixes) in local,
/// international or bare-subscriber form.
#[derive(Debug, Clone, Default)]
pub struct KenyanPhoneValidator;

impl PhoneValidator for KenyanPhoneValidator {
    fn validate(&self, raw: &str) -> Option<String> {
        let digits: String = raw
            .trim()
            .trim_start_matches('+')
            .chars()
            .filter(|c| !matches!(c, ' ' | '-'))
            .collect();

        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }

        let subscriber = if digits.starts_with("254") && digits.len() == 12 {
            &digits[3..]
        } else if digits.starts_with('0') && digits.len() == 10 {
            &digits[1..]
        } else if digits.len() == 9 {
            digits.as_str()
        } else {
            return None;
        };

        if subscriber.starts_with('7') || subscriber.starts_with('1') {
            Some(format!("+254{}", subscriber))
        } else {
            None
        }
    }
}

/// Gateway wire form of an E.164 number: digits only.
pub fn msisdn(e164: &str) -> String {
    e164.trim_start_matches('+').to_string()
}
