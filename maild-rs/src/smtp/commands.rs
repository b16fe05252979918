//! SMTP command parsing (RFC 5321).

use crate::error::{MailError, Result};

/// SMTP protocol commands as defined in RFC 5321.
#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    /// AUTH command with mechanism and optional initial response.
    /// Format: AUTH mechanism [initial-response]
    Auth(String, Option<String>),
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(MailError::SmtpProtocol("Empty command".to_string()));
        }

        let parts: Vec<&str> = line.splitn(2, ' ').collect();
        let command = parts[0].to_uppercase();
        let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

        match command.as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("HELO requires domain".to_string()));
                }
                Ok(SmtpCommand::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("EHLO requires domain".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "MAIL" => {
                let from = Self::parse_path(args, "FROM:")
                    .ok_or_else(|| MailError::SmtpProtocol("Invalid MAIL FROM syntax".to_string()))?;
                Ok(SmtpCommand::MailFrom(from))
            }
            "RCPT" => {
                let to = Self::parse_path(args, "TO:")
                    .ok_or_else(|| MailError::SmtpProtocol("Invalid RCPT TO syntax".to_string()))?;
                Ok(SmtpCommand::RcptTo(to))
            }
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            "AUTH" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("AUTH requires mechanism".to_string()));
                }
                let auth_parts: Vec<&str> = args.splitn(2, ' ').collect();
                let mechanism = auth_parts[0].to_string();
                let initial_response = auth_parts.get(1).map(|s| s.to_string());
                Ok(SmtpCommand::Auth(mechanism, initial_response))
            }
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    /// Parse `FROM:<addr>` / `TO:<addr>`, tolerating a missing bracket
    /// pair and whitespace after the colon.
    fn parse_path(args: &str, prefix: &str) -> Option<String> {
        if !args.to_uppercase().starts_with(prefix) {
            return None;
        }

        let addr = args[prefix.len()..].trim();
        let addr = if addr.starts_with('<') && addr.ends_with('>') {
            &addr[1..addr.len() - 1]
        } else {
            addr
        };

        Some(addr.to_string())
    }
}
