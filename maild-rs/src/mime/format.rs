//! Canonical RFC 5322 serialization.
//!
//! The storage layer only ever writes bytes that went through
//! [`ensure_proper_format`]: a contiguous header block, exactly one blank
//! line, then the body, with CRLF line endings throughout. Headers that
//! were already present are kept in their original order; only missing
//! required headers are filled in, and accidental blank lines inside the
//! header block are removed.

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

fn header_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]*:").unwrap())
}

fn is_header_line(line: &str) -> bool {
    header_name_pattern().is_match(line)
}

fn is_continuation_line(line: &str) -> bool {
    line.starts_with(' ') || line.starts_with('\t')
}

/// Split raw content into the header block (blank lines inside removed)
/// and the body.
fn scan_header_block(content: &str) -> (Vec<String>, Vec<String>) {
    let lines: Vec<&str> = content.lines().collect();
    let mut headers: Vec<String> = Vec::new();
    let mut body_start = 0;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if line.trim().is_empty() {
            // Blank line: header block ends here unless the next non-blank
            // line is still a header line (accidental blank inside the block).
            let mut j = i + 1;
            while j < lines.len() && lines[j].trim().is_empty() {
                j += 1;
            }
            if j < lines.len() && is_header_line(lines[j]) && !headers.is_empty() {
                i = j;
                continue;
            }
            body_start = i + 1;
            break;
        }

        if is_header_line(line) {
            headers.push(line.to_string());
        } else if is_continuation_line(line) && !headers.is_empty() {
            if let Some(last) = headers.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
            }
        } else {
            // Not a header and not a continuation: body starts here
            body_start = i;
            break;
        }

        i += 1;
        body_start = i;
    }

    let body: Vec<String> = lines[body_start.min(lines.len())..]
        .iter()
        .map(|l| l.to_string())
        .collect();

    (headers, body)
}

fn header_present(headers: &[String], name: &str) -> bool {
    let prefix = format!("{}:", name).to_lowercase();
    headers
        .iter()
        .any(|line| line.to_lowercase().starts_with(&prefix))
}

/// Canonicalize a message for storage.
///
/// Layout of the output: one contiguous block of header lines, exactly
/// one blank line, the body. Required headers are added only when
/// missing; nothing already present is stripped or reordered.
pub fn ensure_proper_format(content: &str) -> String {
    let (mut headers, body_lines) = scan_header_block(content);
    let body = body_lines.join("\r\n");

    if !header_present(&headers, "Message-ID") {
        let host = gethostname::gethostname().to_string_lossy().to_string();
        headers.push(format!("Message-ID: <{}@{}>", Uuid::new_v4(), host));
    }
    if !header_present(&headers, "Subject") {
        headers.push("Subject: (no subject)".to_string());
    }
    if !header_present(&headers, "From") {
        headers.push("From: unknown@localhost".to_string());
    }
    if !header_present(&headers, "To") {
        headers.push("To: undisclosed-recipients:;".to_string());
    }
    if !header_present(&headers, "Date") {
        headers.push(format!("Date: {}", Utc::now().to_rfc2822()));
    }
    if !header_present(&headers, "MIME-Version") {
        headers.push("MIME-Version: 1.0".to_string());
    }
    if !header_present(&headers, "Content-Type") {
        headers.push("Content-Type: text/plain; charset=utf-8".to_string());
    }
    if !header_present(&headers, "Content-Transfer-Encoding") {
        let encoding = if looks_like_base64(&body) { "base64" } else { "8bit" };
        headers.push(format!("Content-Transfer-Encoding: {}", encoding));
    }

    let mut out = headers.join("\r\n");
    out.push_str("\r\n\r\n");
    out.push_str(&body);
    if !out.ends_with("\r\n") {
        out.push_str("\r\n");
    }
    out
}

/// Replace the value of the first occurrence of `name`, or prepend the
/// header when the message does not carry it. All other headers keep
/// their position.
pub fn set_header(content: &str, name: &str, value: &str) -> String {
    let (mut headers, body_lines) = scan_header_block(content);
    let prefix = format!("{}:", name).to_lowercase();

    let mut replaced = false;
    for line in headers.iter_mut() {
        if line.to_lowercase().starts_with(&prefix) {
            *line = format!("{}: {}", name, value);
            replaced = true;
            break;
        }
    }
    if !replaced {
        headers.insert(0, format!("{}: {}", name, value));
    }

    let mut out = headers.join("\r\n");
    out.push_str("\r\n\r\n");
    out.push_str(&body_lines.join("\r\n"));
    out
}

/// Majority heuristic: the body is treated as base64 when more than half
/// of its non-trivial lines decode cleanly.
pub fn looks_like_base64(body: &str) -> bool {
    let mut considered = 0usize;
    let mut decodable = 0usize;

    for line in body.lines() {
        let line = line.trim();
        if line.len() <= 20 {
            continue;
        }
        considered += 1;
        if general_purpose::STANDARD.decode(line).is_ok() {
            decodable += 1;
        }
    }

    considered > 0 && decodable * 2 > considered
}

/// Extract readable text from an HTML body.
///
/// Drops tags (including script/style contents) and decodes the common
/// entities. Used as the plain-text fallback for spam analysis.
pub fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut chars = html.char_indices().peekable();
    // ASCII-only lowering keeps byte offsets aligned with the input
    let lower: String = html.chars().map(|c| c.to_ascii_lowercase()).collect();
    let mut skip_until: Option<&str> = None;

    while let Some((i, ch)) = chars.next() {
        if let Some(end_tag) = skip_until {
            if ch == '<' && lower[i..].starts_with(end_tag) {
                skip_until = None;
                while let Some(&(_, c)) = chars.peek() {
                    chars.next();
                    if c == '>' {
                        break;
                    }
                }
            }
            continue;
        }

        if ch == '<' {
            if lower[i..].starts_with("<script") {
                skip_until = Some("</script");
            } else if lower[i..].starts_with("<style") {
                skip_until = Some("</style");
            }
            let block_break = lower[i..].starts_with("<br")
                || lower[i..].starts_with("<p")
                || lower[i..].starts_with("</p")
                || lower[i..].starts_with("<div")
                || lower[i..].starts_with("</div");
            while let Some(&(_, c)) = chars.peek() {
                chars.next();
                if c == '>' {
                    break;
                }
            }
            if block_break && !out.ends_with('\n') {
                out.push('\n');
            }
            continue;
        }

        out.push(ch);
    }

    for (entity, replacement) in [
        ("&nbsp;", " "),
        ("&amp;", "&"),
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&#39;", "'"),
    ] {
        out = out.replace(entity, replacement);
    }

    out.trim().to_string()
}

/// Format an ISO-8601 timestamp for a Date header; unparseable input
/// passes through unchanged.
pub fn rfc2822_date(iso: &str) -> String {
    match chrono::DateTime::parse_from_rfc3339(iso) {
        Ok(dt) => dt.to_rfc2822(),
        Err(_) => match chrono::NaiveDateTime::parse_from_str(iso, "%Y-%m-%dT%H:%M:%S%.f") {
            Ok(naive) => naive.and_utc().to_rfc2822(),
            Err(_) => iso.to_string(),
        },
    }
}

/// Rebuild a minimal RFC 5322 envelope from stored metadata.
///
/// Used when the `.eml` file for a message can no longer be located.
pub fn minimal_envelope(
    message_id: &str,
    from_addr: &str,
    to_addrs: &[String],
    subject: &str,
    date_iso: &str,
) -> String {
    let date = if date_iso.is_empty() {
        Utc::now().to_rfc2822()
    } else {
        rfc2822_date(date_iso)
    };
    let to_line = if to_addrs.is_empty() {
        "undisclosed-recipients:;".to_string()
    } else {
        to_addrs.join(", ")
    };

    format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\nMessage-ID: {}\r\nDate: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=\"utf-8\"\r\n\r\n[The original content of this message is unavailable]\r\n",
        from_addr, to_line, subject, message_id, date
    )
}
