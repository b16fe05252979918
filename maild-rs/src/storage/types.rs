use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Metadata row for a received email.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailRecord {
    pub message_id: String,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    pub subject: String,
    /// ISO-8601 timestamp; lexicographic order equals chronological order.
    pub date: String,
    pub size: i64,
    pub is_read: bool,
    pub is_deleted: bool,
    pub is_spam: bool,
    pub spam_score: f64,
    pub content_path: Option<String>,
    pub is_recalled: bool,
    pub recalled_at: Option<String>,
    pub recalled_by: Option<String>,
}

impl EmailRecord {
    pub fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            message_id: row.try_get("message_id")?,
            from_addr: row.try_get("from_addr")?,
            to_addrs: decode_addr_list(row.try_get::<String, _>("to_addrs")?),
            subject: row.try_get("subject")?,
            date: row.try_get("date")?,
            size: row.try_get("size")?,
            is_read: row.try_get("is_read")?,
            is_deleted: row.try_get("is_deleted")?,
            is_spam: row.try_get("is_spam")?,
            spam_score: row.try_get("spam_score")?,
            content_path: row.try_get("content_path")?,
            is_recalled: row.try_get("is_recalled")?,
            recalled_at: row.try_get("recalled_at")?,
            recalled_by: row.try_get("recalled_by")?,
        })
    }
}

/// Metadata row for a sent email.
#[derive(Debug, Clone, PartialEq)]
pub struct SentEmailRecord {
    pub message_id: String,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    pub cc_addrs: Vec<String>,
    pub bcc_addrs: Vec<String>,
    pub subject: String,
    pub date: String,
    pub size: i64,
    pub has_attachments: bool,
    pub content_path: Option<String>,
    pub status: String,
    pub is_read: bool,
    pub is_spam: bool,
    pub spam_score: f64,
    pub is_recalled: bool,
    pub recalled_at: Option<String>,
    pub recalled_by: Option<String>,
}

impl SentEmailRecord {
    pub fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            message_id: row.try_get("message_id")?,
            from_addr: row.try_get("from_addr")?,
            to_addrs: decode_addr_list(row.try_get::<String, _>("to_addrs")?),
            cc_addrs: row
                .try_get::<Option<String>, _>("cc_addrs")?
                .map(decode_addr_list)
                .unwrap_or_default(),
            bcc_addrs: row
                .try_get::<Option<String>, _>("bcc_addrs")?
                .map(decode_addr_list)
                .unwrap_or_default(),
            subject: row.try_get("subject")?,
            date: row.try_get("date")?,
            size: row.try_get("size")?,
            has_attachments: row.try_get("has_attachments")?,
            content_path: row.try_get("content_path")?,
            status: row.try_get("status")?,
            is_read: row.try_get("is_read")?,
            is_spam: row.try_get("is_spam")?,
            spam_score: row.try_get("spam_score")?,
            is_recalled: row.try_get("is_recalled")?,
            recalled_at: row.try_get("recalled_at")?,
            recalled_by: row.try_get("recalled_by")?,
        })
    }
}

/// Which table a search hit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxKind {
    Received,
    Sent,
}

/// A merged search result across both tables.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub kind: MailboxKind,
    pub message_id: String,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    pub subject: String,
    pub date: String,
}

/// Address lists are serialized as JSON arrays in their TEXT columns.
/// Legacy rows holding a bare address string decode to a single element.
fn decode_addr_list(raw: String) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(&raw) {
        Ok(list) => list,
        Err(_) if raw.trim().is_empty() => Vec::new(),
        Err(_) => vec![raw],
    }
}

pub(crate) fn encode_addr_list(addrs: &[String]) -> String {
    serde_json::to_string(addrs).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_list_round_trip() {
        let addrs = vec!["a@b.com".to_string(), "c@d.org".to_string()];
        let encoded = encode_addr_list(&addrs);
        assert_eq!(decode_addr_list(encoded), addrs);
    }

    #[test]
    fn test_addr_list_legacy_plain_string() {
        assert_eq!(
            decode_addr_list("a@b.com".to_string()),
            vec!["a@b.com".to_string()]
        );
        assert!(decode_addr_list("".to_string()).is_empty());
    }
}
