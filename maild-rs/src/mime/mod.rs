//! RFC 5322 parsing and canonical serialization.

pub mod format;
pub mod parser;
pub mod types;

pub use format::{ensure_proper_format, looks_like_base64, minimal_envelope, strip_html};
pub use parser::MimeParser;
pub use types::{Attachment, EmailAddress, ParsedEmail};
