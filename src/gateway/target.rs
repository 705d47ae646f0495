//! Recipient normalization

/// Shortest digit string accepted as a phone number
pub const MIN_PHONE_DIGITS: usize = 8;

const USER_SUFFIX: &str = "@c.us";

/// Strip everything but digits; `None` if fewer than [`MIN_PHONE_DIGITS`] remain
pub fn normalize_number(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    (digits.len() >= MIN_PHONE_DIGITS).then_some(digits)
}

/// Gateway chat id for a phone number. Ids that already carry a domain
/// (`...@c.us`, `...@g.us`) pass through unchanged.
pub fn to_chat_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.contains('@') {
        return Some(trimmed.to_string());
    }
    normalize_number(trimmed).map(|digits| format!("{}{}", digits, USER_SUFFIX))
}
