use crate::error::{MailError, Result};
use regex::Regex;
use std::sync::OnceLock;

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").unwrap()
    })
}

/// Extract the bare address from either `local@domain.tld` or
/// `"Display Name" <local@domain.tld>`.
///
/// Returns `(display_name, address)`. The display name is empty for bare
/// addresses; surrounding quotes are stripped.
pub fn extract_address(raw: &str) -> (String, String) {
    let raw = raw.trim();

    if let (Some(open), Some(close)) = (raw.rfind('<'), raw.rfind('>')) {
        if open < close {
            let name = raw[..open].trim().trim_matches('"').trim().to_string();
            let addr = raw[open + 1..close].trim().to_string();
            return (name, addr);
        }
    }

    (String::new(), raw.to_string())
}

/// Check an address (bare or display-name form) against the practical
/// RFC 5322 subset used throughout the store.
pub fn is_valid_address(raw: &str) -> bool {
    if raw.trim().is_empty() {
        return false;
    }

    let (_, addr) = extract_address(raw);
    if addr.is_empty() {
        return false;
    }

    address_pattern().is_match(&addr)
}

/// Validate an address used in an SMTP envelope.
pub fn validate_email(email: &str) -> Result<()> {
    if email.is_empty() {
        return Err(MailError::InvalidEmail("address is empty".to_string()));
    }

    if !is_valid_address(email) {
        return Err(MailError::InvalidEmail(email.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_addresses() {
        assert!(is_valid_address("test@example.com"));
        assert!(is_valid_address("user.name@example.co.uk"));
        assert!(is_valid_address("Alice <alice@test.local>"));
        assert!(is_valid_address("\"Bob Jones\" <bob+tag@example.org>"));
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(!is_valid_address(""));
        assert!(!is_valid_address("   "));
        assert!(!is_valid_address("test"));
        assert!(!is_valid_address("test@"));
        assert!(!is_valid_address("@example.com"));
        assert!(!is_valid_address("test@domain"));
        assert!(!is_valid_address("Alice <>"));
    }

    #[test]
    fn test_extract_address() {
        assert_eq!(
            extract_address("Alice <alice@test.local>"),
            ("Alice".to_string(), "alice@test.local".to_string())
        );
        assert_eq!(
            extract_address("\"Bob Jones\" <bob@x.org>"),
            ("Bob Jones".to_string(), "bob@x.org".to_string())
        );
        assert_eq!(
            extract_address("plain@addr.net"),
            (String::new(), "plain@addr.net".to_string())
        );
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("a@b.com").is_ok());
        assert!(validate_email("").is_err());
        assert!(validate_email("nope").is_err());
    }
}
