use chrono::{DateTime, Utc};

/// A mailbox as it appears in From/To/Cc headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailAddress {
    pub name: String,
    pub address: String,
}

impl EmailAddress {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Sentinel used when a message carries no usable From header.
    pub fn unknown() -> Self {
        Self::new("", "unknown@localhost")
    }

    pub fn is_unknown(&self) -> bool {
        self.address.is_empty() || self.address == "unknown@localhost" || self.address == "unknown"
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{} <{}>", self.name, self.address)
        }
    }
}

/// An attachment extracted from a MIME part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: Option<String>,
    pub content_type: String,
    pub data: Vec<u8>,
    pub size: usize,
}

/// A parsed RFC 5322 message.
///
/// Headers keep their original order and spelling; lookup is
/// case-insensitive. `text_content`/`html_content` concatenate the inline
/// text parts of the MIME tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEmail {
    pub message_id: String,
    pub subject: String,
    pub from_addr: EmailAddress,
    pub to_addrs: Vec<EmailAddress>,
    pub cc_addrs: Vec<EmailAddress>,
    pub date: Option<DateTime<Utc>>,
    pub text_content: Option<String>,
    pub html_content: Option<String>,
    pub attachments: Vec<Attachment>,
    pub headers: Vec<(String, String)>,
}

impl ParsedEmail {
    /// Case-insensitive lookup of the first header with the given name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Plain text body, falling back to tag-stripped HTML.
    pub fn plain_text(&self) -> String {
        if let Some(text) = &self.text_content {
            if !text.trim().is_empty() {
                return text.clone();
            }
        }
        if let Some(html) = &self.html_content {
            return super::format::strip_html(html);
        }
        String::new()
    }
}

/// A single part of a multipart message, before classification.
#[derive(Debug, Clone, Default)]
pub struct MimePart {
    pub content_type: String,
    pub content_disposition: Option<String>,
    pub encoding: Option<String>,
    pub filename: Option<String>,
    pub body: Vec<u8>,
    pub is_attachment: bool,
}
