//! Phone number canonicalization.
//!
//! Every phone number that enters the system is normalized to E.164 before it
//! is matched, stored, or compared. NANP numbers without a country code are
//! assumed to be US/Canada (`+1`).

use thiserror::Error;

const MIN_E164_DIGITS: usize = 7;
const MAX_E164_DIGITS: usize = 15;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PhoneError {
    #[error("phone number is empty")]
    Empty,
    #[error("phone number `{0}` could not be normalized to E.164")]
    Unparseable(String),
}

/// Normalize a raw provider-supplied phone number to E.164.
///
/// Accepted shapes:
/// - `+<country><number>` with 7..=15 digits total
/// - 10 NANP digits (`5551234567`, `(555) 123-4567`, `555-123-4567`)
/// - 11 digits with a leading `1` (`15551234567`)
pub fn normalize(raw: &str) -> Result<String, PhoneError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PhoneError::Empty);
    }

    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

    if has_plus {
        if (MIN_E164_DIGITS..=MAX_E164_DIGITS).contains(&digits.len()) {
            return Ok(format!("+{digits}"));
        }
        return Err(PhoneError::Unparseable(raw.to_string()));
    }

    match digits.len() {
        10 => Ok(format!("+1{digits}")),
        11 if digits.starts_with('1') => Ok(format!("+{digits}")),
        _ => Err(PhoneError::Unparseable(raw.to_string())),
    }
}

/// Last four digits, used for placeholder customer names.
pub fn tail(normalized: &str) -> &str {
    let digits_start = normalized.len().saturating_sub(4);
    &normalized[digits_start..]
}
