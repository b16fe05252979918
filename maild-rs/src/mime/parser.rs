use crate::error::{MailError, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

use super::types::{EmailAddress, MimePart, ParsedEmail};
use crate::utils::email::extract_address;

fn rfc2047_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"=\?([^?]+)\?([BbQq])\?([^?]*)\?=").unwrap())
}

/// MIME message parser
pub struct MimeParser;

impl MimeParser {
    /// Parse a raw message into a [`ParsedEmail`].
    ///
    /// Input bytes are decoded as UTF-8 with lossy replacement. Headers
    /// keep their original order; inline text parts are collected into
    /// `text_content`/`html_content`, everything with an attachment
    /// disposition or an `application/*` type becomes an attachment.
    pub fn parse(message: &[u8]) -> Result<ParsedEmail> {
        let message_str = String::from_utf8_lossy(message);

        let (headers_str, body_str) = Self::split_headers_body(&message_str);
        let headers = Self::parse_header_lines(&headers_str);

        let mut parsed = ParsedEmail {
            headers,
            ..Default::default()
        };

        parsed.message_id = parsed
            .header("Message-ID")
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        parsed.subject = parsed
            .header("Subject")
            .map(Self::decode_rfc2047)
            .unwrap_or_default();
        parsed.from_addr = parsed
            .header("From")
            .map(|v| {
                let (name, address) = extract_address(&Self::decode_rfc2047(v));
                EmailAddress::new(name, address)
            })
            .unwrap_or_else(EmailAddress::unknown);
        parsed.to_addrs = parsed
            .header("To")
            .map(Self::parse_address_list)
            .unwrap_or_default();
        parsed.cc_addrs = parsed
            .header("Cc")
            .map(Self::parse_address_list)
            .unwrap_or_default();
        parsed.date = parsed.header("Date").and_then(Self::parse_date);

        let content_type = parsed
            .header("Content-Type")
            .unwrap_or("text/plain")
            .to_string();
        let encoding = parsed
            .header("Content-Transfer-Encoding")
            .map(|v| v.to_string());

        if content_type.to_lowercase().contains("multipart/") {
            match Self::extract_boundary(&content_type) {
                Some(boundary) => {
                    for part in Self::parse_multipart(&boundary, &body_str) {
                        Self::categorize_part(&mut parsed, part);
                    }
                }
                None => {
                    parsed.text_content = Some(body_str);
                }
            }
        } else {
            // Single-part message, decode according to its own headers
            let part = MimePart {
                content_type: content_type.clone(),
                encoding,
                body: body_str.into_bytes(),
                ..Default::default()
            };
            Self::categorize_part(&mut parsed, part);
        }

        Ok(parsed)
    }

    /// Split message into headers and body at the first blank line.
    pub fn split_headers_body(message: &str) -> (String, String) {
        if let Some(pos) = message.find("\r\n\r\n") {
            (message[..pos].to_string(), message[pos + 4..].to_string())
        } else if let Some(pos) = message.find("\n\n") {
            (message[..pos].to_string(), message[pos + 2..].to_string())
        } else {
            (message.to_string(), String::new())
        }
    }

    /// Parse header lines into an ordered list, unfolding continuations.
    pub fn parse_header_lines(headers_str: &str) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        let mut current: Option<(String, String)> = None;

        for line in headers_str.lines() {
            if line.starts_with(' ') || line.starts_with('\t') {
                // Folded continuation of the previous header
                if let Some((_, ref mut value)) = current {
                    value.push(' ');
                    value.push_str(line.trim());
                }
            } else if let Some(colon) = line.find(':') {
                if let Some(header) = current.take() {
                    headers.push(header);
                }
                let name = line[..colon].trim().to_string();
                let value = line[colon + 1..].trim().to_string();
                current = Some((name, value));
            }
        }

        if let Some(header) = current {
            headers.push(header);
        }

        headers
    }

    /// Decode RFC 2047 encoded words (`=?charset?B|Q?...?=`).
    ///
    /// Only UTF-8 compatible charsets are decoded; anything else passes
    /// through with lossy replacement.
    pub fn decode_rfc2047(value: &str) -> String {
        rfc2047_pattern()
            .replace_all(value, |caps: &regex::Captures| {
                let encoding = &caps[2];
                let payload = &caps[3];

                let decoded = match encoding {
                    "B" | "b" => general_purpose::STANDARD.decode(payload).ok(),
                    _ => Some(Self::decode_q_encoding(payload)),
                };

                match decoded {
                    Some(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                    None => caps[0].to_string(),
                }
            })
            .to_string()
    }

    /// Q-encoding: like quoted-printable, but `_` stands for a space.
    fn decode_q_encoding(payload: &str) -> Vec<u8> {
        Self::decode_quoted_printable(payload.replace('_', " ").as_bytes())
    }

    /// Parse a comma-separated address list.
    pub fn parse_address_list(value: &str) -> Vec<EmailAddress> {
        value
            .split(',')
            .map(|part| {
                let (name, address) = extract_address(part);
                EmailAddress::new(name, address)
            })
            .filter(|addr| addr.address.contains('@'))
            .collect()
    }

    /// Parse a Date header, trying RFC 2822 then ISO 8601.
    pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
        let value = value.trim();
        if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
            return Some(naive.and_utc());
        }
        None
    }

    /// Extract the boundary parameter from a Content-Type header.
    fn extract_boundary(content_type: &str) -> Option<String> {
        Self::extract_parameter(content_type, "boundary")
    }

    /// Extract a parameter value from a header (e.g. `filename="file.txt"`).
    fn extract_parameter(header: &str, param_name: &str) -> Option<String> {
        for part in header.split(';') {
            let part = part.trim();
            let prefix = format!("{}=", param_name);
            if part.to_lowercase().starts_with(&prefix) {
                let value = &part[prefix.len()..];
                let value = value.trim_matches('"').trim_matches('\'');
                return Some(value.to_string());
            }
        }
        None
    }

    /// Parse a multipart body into parts, recursing into nested
    /// multipart sections.
    fn parse_multipart(boundary: &str, body: &str) -> Vec<MimePart> {
        let mut parts = Vec::new();
        let boundary_marker = format!("--{}", boundary);

        for section in body.split(&boundary_marker) {
            let section = section.trim();

            // Skip the preamble and the end marker
            if section.is_empty() || section.starts_with("--") {
                continue;
            }

            let (part_headers_str, part_body) = Self::split_headers_body(section);
            let part_headers = Self::parse_header_lines(&part_headers_str);
            let lookup = |name: &str| {
                part_headers
                    .iter()
                    .find(|(n, _)| n.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v.clone())
            };

            let content_type = lookup("Content-Type").unwrap_or_default();

            // Nested multipart (e.g. alternative inside mixed)
            if content_type.to_lowercase().contains("multipart/") {
                if let Some(inner) = Self::extract_boundary(&content_type) {
                    parts.extend(Self::parse_multipart(&inner, &part_body));
                    continue;
                }
            }

            let mut part = MimePart {
                content_type: content_type.clone(),
                ..Default::default()
            };

            if !content_type.is_empty() {
                if let Some(name) = Self::extract_parameter(&content_type, "name") {
                    part.filename = Some(name);
                }
            }

            if let Some(disposition) = lookup("Content-Disposition") {
                if disposition.to_lowercase().contains("attachment") {
                    part.is_attachment = true;
                }
                if let Some(filename) = Self::extract_parameter(&disposition, "filename") {
                    part.filename = Some(filename);
                }
                part.content_disposition = Some(disposition);
            }

            part.encoding = lookup("Content-Transfer-Encoding");
            part.body = part_body.into_bytes();

            parts.push(part);
        }

        parts
    }

    /// Sort a MIME part into text/HTML content or the attachment list.
    fn categorize_part(parsed: &mut ParsedEmail, part: MimePart) {
        let content_type = part.content_type.to_lowercase();
        let is_inline_text = !part.is_attachment
            && (content_type.contains("text/plain")
                || content_type.is_empty()
                || content_type.contains("text/html"));

        if is_inline_text {
            let decoded = Self::decode_body(&part).unwrap_or_else(|_| part.body.clone());
            let text = String::from_utf8_lossy(&decoded).to_string();
            let target = if content_type.contains("text/html") {
                &mut parsed.html_content
            } else {
                &mut parsed.text_content
            };
            match target {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(&text);
                }
                None => *target = Some(text),
            }
        } else {
            let data = Self::decode_body(&part).unwrap_or_else(|_| part.body.clone());
            let size = data.len();
            parsed.attachments.push(super::types::Attachment {
                filename: part.filename,
                content_type: part.content_type,
                data,
                size,
            });
        }
    }

    /// Decode a part body based on its Content-Transfer-Encoding.
    fn decode_body(part: &MimePart) -> Result<Vec<u8>> {
        match &part.encoding {
            Some(encoding) => {
                let encoding = encoding.to_lowercase();
                if encoding.contains("base64") {
                    Self::decode_base64(&part.body)
                } else if encoding.contains("quoted-printable") {
                    Ok(Self::decode_quoted_printable(&part.body))
                } else {
                    // 7bit, 8bit, binary
                    Ok(part.body.clone())
                }
            }
            None => Ok(part.body.clone()),
        }
    }

    fn decode_base64(content: &[u8]) -> Result<Vec<u8>> {
        let cleaned: Vec<u8> = content
            .iter()
            .filter(|&&b| !b.is_ascii_whitespace())
            .copied()
            .collect();

        general_purpose::STANDARD
            .decode(&cleaned)
            .map_err(|e| MailError::Parse(format!("base64 decode error: {}", e)))
    }

    fn decode_quoted_printable(content: &[u8]) -> Vec<u8> {
        let mut result = Vec::new();
        let text = String::from_utf8_lossy(content);
        let mut chars = text.chars().peekable();

        while let Some(ch) = chars.next() {
            if ch == '=' {
                // Soft line break
                if chars.peek() == Some(&'\n') || chars.peek() == Some(&'\r') {
                    chars.next();
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                    continue;
                }

                let mut hex = String::new();
                if let Some(c1) = chars.next() {
                    hex.push(c1);
                }
                if let Some(c2) = chars.next() {
                    hex.push(c2);
                }

                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    result.push(byte);
                } else {
                    result.push(b'=');
                    result.extend(hex.as_bytes());
                }
            } else {
                let mut buf = [0u8; 4];
                result.extend(ch.encode_utf8(&mut buf).as_bytes());
            }
        }

        result
    }
}
