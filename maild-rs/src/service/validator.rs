//! Structural validation of ingress payloads.
//!
//! Validation runs on the payload as received; sanitization produces a
//! normalized copy and never mutates the original.

use crate::service::IncomingEmail;
use crate::utils::email::is_valid_address;
use chrono::Utc;

/// Outcome of a validation pass. Errors are fatal, warnings are not.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct EmailValidator;

impl EmailValidator {
    /// Check the required fields, address syntax, and date format.
    pub fn validate(email: &IncomingEmail) -> ValidationReport {
        let mut report = ValidationReport::default();

        if email.message_id.trim().is_empty() {
            report.errors.push("missing required field: message_id".to_string());
        }
        if email.from_addr.trim().is_empty() {
            report.errors.push("missing required field: from_addr".to_string());
        }
        if email.to_addrs.is_empty() || email.to_addrs.iter().all(|a| a.trim().is_empty()) {
            report.errors.push("missing required field: to_addrs".to_string());
        }
        if email.subject.is_empty() {
            report.errors.push("missing required field: subject".to_string());
        }
        if email.date.trim().is_empty() {
            report.errors.push("missing required field: date".to_string());
        }

        if !email.from_addr.trim().is_empty() && !is_valid_address(&email.from_addr) {
            report
                .errors
                .push(format!("invalid sender address: {}", email.from_addr));
        }

        for addr in &email.to_addrs {
            if !addr.trim().is_empty() && !is_valid_address(addr) {
                report
                    .errors
                    .push(format!("invalid recipient address: {}", addr));
            }
        }

        if !email.date.trim().is_empty() && parse_iso_date(&email.date).is_none() {
            report.errors.push(format!("invalid date: {}", email.date));
        }

        // Message-ID shape problems are non-fatal
        if !email.message_id.trim().is_empty() {
            let inner = email.message_id.trim().trim_matches(|c| c == '<' || c == '>');
            if !inner.contains('@') || inner.len() <= 3 {
                report
                    .warnings
                    .push(format!("message id looks malformed: {}", email.message_id));
            }
        }

        report
    }

    /// Produce a normalized copy: `<...>`-wrapped Message-ID, trimmed
    /// addresses, ISO-8601 date (unparseable input becomes now), and a
    /// `(no subject)` default.
    pub fn sanitize(email: &IncomingEmail) -> IncomingEmail {
        let mut sanitized = email.clone();

        let message_id = sanitized.message_id.trim().to_string();
        sanitized.message_id = if !message_id.starts_with('<') && message_id.contains('@') {
            format!("<{}>", message_id)
        } else {
            message_id
        };

        sanitized.from_addr = sanitized.from_addr.trim().to_string();
        sanitized.to_addrs = sanitized
            .to_addrs
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        sanitized.date = match parse_iso_date(&sanitized.date) {
            Some(normalized) => normalized,
            None => Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        };

        if sanitized.subject.is_empty() {
            sanitized.subject = "(no subject)".to_string();
        }

        sanitized
    }
}

/// Parse an ISO-8601 timestamp, returning it re-serialized in the
/// canonical storage form.
fn parse_iso_date(value: &str) -> Option<String> {
    let value = value.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(
            dt.naive_utc()
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
        );
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.format("%Y-%m-%dT%H:%M:%S%.6f").to_string());
    }
    None
}
