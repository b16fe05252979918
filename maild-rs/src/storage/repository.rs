//! SQL access for the `emails` and `sent_emails` tables.
//!
//! Queries never touch the filesystem; content lives in the
//! [`ContentStore`](super::ContentStore). Inserts are keyed on
//! `message_id` and deduplicate via `INSERT OR IGNORE`, so two concurrent
//! ingresses of the same message leave exactly one row.

use crate::error::Result;
use crate::storage::pool::with_busy_retry;
use crate::storage::types::{
    encode_addr_list, EmailRecord, MailboxKind, SearchHit, SentEmailRecord,
};
use crate::utils::email::extract_address;
use sqlx::SqlitePool;
use tracing::{debug, warn};

/// Filters for listing received emails.
#[derive(Debug, Clone)]
pub struct EmailQuery {
    pub user_email: Option<String>,
    pub include_deleted: bool,
    pub include_spam: bool,
    pub include_recalled: bool,
    pub is_spam: Option<bool>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for EmailQuery {
    fn default() -> Self {
        Self {
            user_email: None,
            include_deleted: false,
            include_spam: true,
            include_recalled: false,
            is_spam: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Partial update of a received email's status flags.
#[derive(Debug, Clone, Default)]
pub struct EmailStatusUpdate {
    pub is_read: Option<bool>,
    pub is_deleted: Option<bool>,
    pub is_spam: Option<bool>,
    pub spam_score: Option<f64>,
}

impl EmailStatusUpdate {
    pub fn is_empty(&self) -> bool {
        self.is_read.is_none()
            && self.is_deleted.is_none()
            && self.is_spam.is_none()
            && self.spam_score.is_none()
    }
}

/// Partial update of a sent email's status.
#[derive(Debug, Clone, Default)]
pub struct SentStatusUpdate {
    pub is_read: Option<bool>,
    pub status: Option<String>,
}

impl SentStatusUpdate {
    pub fn is_empty(&self) -> bool {
        self.is_read.is_none() && self.status.is_none()
    }
}

#[derive(Clone)]
pub struct EmailRepository {
    pool: SqlitePool,
}

impl EmailRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a received email row. Returns `true` when a new row was
    /// written, `false` when a row with this Message-ID already existed.
    pub async fn insert_email(&self, record: &EmailRecord) -> Result<bool> {
        let result = with_busy_retry(|| {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO emails (
                    message_id, from_addr, to_addrs, subject, date, size,
                    is_read, is_deleted, is_spam, spam_score, content_path,
                    is_recalled, recalled_at, recalled_by
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.message_id)
            .bind(&record.from_addr)
            .bind(encode_addr_list(&record.to_addrs))
            .bind(&record.subject)
            .bind(&record.date)
            .bind(record.size)
            .bind(record.is_read)
            .bind(record.is_deleted)
            .bind(record.is_spam)
            .bind(record.spam_score)
            .bind(&record.content_path)
            .bind(record.is_recalled)
            .bind(&record.recalled_at)
            .bind(&record.recalled_by)
            .execute(&self.pool)
        })
        .await?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            debug!("Created email record: {}", record.message_id);
        } else {
            debug!(
                "Email record already present, insert skipped: {}",
                record.message_id
            );
        }
        Ok(inserted)
    }

    pub async fn get_email(&self, message_id: &str) -> Result<Option<EmailRecord>> {
        let row = sqlx::query("SELECT * FROM emails WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| EmailRecord::from_row(&r)).transpose().map_err(Into::into)
    }

    /// List received emails, newest first.
    ///
    /// The user filter runs in two stages: a broad SQL `LIKE` prefilter
    /// over the JSON `to_addrs` column, then exact element equality on
    /// the decoded list (bare or display-name form) or on `from_addr`.
    pub async fn list_emails(&self, query: &EmailQuery) -> Result<Vec<EmailRecord>> {
        let mut sql = String::from("SELECT * FROM emails WHERE 1=1");
        if query.user_email.is_some() {
            sql.push_str(" AND (to_addrs LIKE ? OR from_addr = ? OR from_addr LIKE ?)");
        }
        if !query.include_deleted {
            sql.push_str(" AND is_deleted = 0");
        }
        if !query.include_spam {
            sql.push_str(" AND is_spam = 0");
        }
        if !query.include_recalled {
            sql.push_str(" AND is_recalled = 0");
        }
        if query.is_spam.is_some() {
            sql.push_str(" AND is_spam = ?");
        }
        sql.push_str(" ORDER BY date DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&sql);
        if let Some(user) = &query.user_email {
            q = q
                .bind(format!("%{}%", user))
                .bind(user)
                .bind(format!("%<{}>%", user));
        }
        if let Some(is_spam) = query.is_spam {
            q = q.bind(is_spam);
        }
        q = q.bind(query.limit).bind(query.offset);

        let rows = q.fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match EmailRecord::from_row(row) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable email row: {}", e),
            }
        }

        if let Some(user) = &query.user_email {
            records.retain(|record| Self::matches_user(record, user));
        }

        Ok(records)
    }

    fn matches_user(record: &EmailRecord, user: &str) -> bool {
        let recipient = record.to_addrs.iter().any(|addr| {
            addr == user || extract_address(addr).1 == user
        });
        recipient || record.from_addr == user || extract_address(&record.from_addr).1 == user
    }

    /// Apply a partial status update. Returns `true` when a row changed.
    pub async fn update_email_status(
        &self,
        message_id: &str,
        update: &EmailStatusUpdate,
    ) -> Result<bool> {
        if update.is_empty() {
            warn!("Empty status update for {}", message_id);
            return Ok(false);
        }

        let mut sets = Vec::new();
        if update.is_read.is_some() {
            sets.push("is_read = ?");
        }
        if update.is_deleted.is_some() {
            sets.push("is_deleted = ?");
        }
        if update.is_spam.is_some() {
            sets.push("is_spam = ?");
        }
        if update.spam_score.is_some() {
            sets.push("spam_score = ?");
        }
        let sql = format!(
            "UPDATE emails SET {} WHERE message_id = ?",
            sets.join(", ")
        );

        let result = with_busy_retry(|| {
            let mut q = sqlx::query(&sql);
            if let Some(v) = update.is_read {
                q = q.bind(v);
            }
            if let Some(v) = update.is_deleted {
                q = q.bind(v);
            }
            if let Some(v) = update.is_spam {
                q = q.bind(v);
            }
            if let Some(v) = update.spam_score {
                q = q.bind(v);
            }
            q.bind(message_id).execute(&self.pool)
        })
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a received email row entirely.
    pub async fn delete_email(&self, message_id: &str) -> Result<bool> {
        let result = with_busy_retry(|| {
            sqlx::query("DELETE FROM emails WHERE message_id = ?")
                .bind(message_id)
                .execute(&self.pool)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Flip the recall flag on a received email.
    pub async fn recall_email(
        &self,
        message_id: &str,
        recalled_by: &str,
        recalled_at: &str,
    ) -> Result<bool> {
        let result = with_busy_retry(|| {
            sqlx::query(
                "UPDATE emails SET is_recalled = 1, recalled_at = ?, recalled_by = ? WHERE message_id = ?",
            )
            .bind(recalled_at)
            .bind(recalled_by)
            .bind(message_id)
            .execute(&self.pool)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_sent_email(&self, record: &SentEmailRecord) -> Result<bool> {
        let result = with_busy_retry(|| {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO sent_emails (
                    message_id, from_addr, to_addrs, cc_addrs, bcc_addrs,
                    subject, date, size, has_attachments, content_path,
                    status, is_read, is_spam, spam_score,
                    is_recalled, recalled_at, recalled_by
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.message_id)
            .bind(&record.from_addr)
            .bind(encode_addr_list(&record.to_addrs))
            .bind(encode_addr_list(&record.cc_addrs))
            .bind(encode_addr_list(&record.bcc_addrs))
            .bind(&record.subject)
            .bind(&record.date)
            .bind(record.size)
            .bind(record.has_attachments)
            .bind(&record.content_path)
            .bind(&record.status)
            .bind(record.is_read)
            .bind(record.is_spam)
            .bind(record.spam_score)
            .bind(record.is_recalled)
            .bind(&record.recalled_at)
            .bind(&record.recalled_by)
            .execute(&self.pool)
        })
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_sent_email(&self, message_id: &str) -> Result<Option<SentEmailRecord>> {
        let row = sqlx::query("SELECT * FROM sent_emails WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| SentEmailRecord::from_row(&r))
            .transpose()
            .map_err(Into::into)
    }

    pub async fn list_sent_emails(
        &self,
        from_addr: Option<&str>,
        include_spam: bool,
        is_spam: Option<bool>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SentEmailRecord>> {
        let mut sql = String::from("SELECT * FROM sent_emails WHERE 1=1");
        if from_addr.is_some() {
            sql.push_str(" AND from_addr = ?");
        }
        if !include_spam {
            sql.push_str(" AND (is_spam = 0 OR is_spam IS NULL)");
        } else if let Some(flag) = is_spam {
            if flag {
                sql.push_str(" AND is_spam = 1");
            } else {
                sql.push_str(" AND (is_spam = 0 OR is_spam IS NULL)");
            }
        }
        sql.push_str(" ORDER BY date DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&sql);
        if let Some(from) = from_addr {
            q = q.bind(from);
        }
        q = q.bind(limit).bind(offset);

        let rows = q.fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match SentEmailRecord::from_row(row) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable sent email row: {}", e),
            }
        }
        Ok(records)
    }

    pub async fn update_sent_status(
        &self,
        message_id: &str,
        update: &SentStatusUpdate,
    ) -> Result<bool> {
        if update.is_empty() {
            return Ok(false);
        }

        let mut sets = Vec::new();
        if update.is_read.is_some() {
            sets.push("is_read = ?");
        }
        if update.status.is_some() {
            sets.push("status = ?");
        }
        let sql = format!(
            "UPDATE sent_emails SET {} WHERE message_id = ?",
            sets.join(", ")
        );

        let result = with_busy_retry(|| {
            let mut q = sqlx::query(&sql);
            if let Some(v) = update.is_read {
                q = q.bind(v);
            }
            if let Some(v) = &update.status {
                q = q.bind(v);
            }
            q.bind(message_id).execute(&self.pool)
        })
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_sent_email(&self, message_id: &str) -> Result<bool> {
        let result = with_busy_retry(|| {
            sqlx::query("DELETE FROM sent_emails WHERE message_id = ?")
                .bind(message_id)
                .execute(&self.pool)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn recall_sent_email(
        &self,
        message_id: &str,
        recalled_by: &str,
        recalled_at: &str,
    ) -> Result<bool> {
        let result = with_busy_retry(|| {
            sqlx::query(
                "UPDATE sent_emails SET is_recalled = 1, recalled_at = ?, recalled_by = ? WHERE message_id = ?",
            )
            .bind(recalled_at)
            .bind(recalled_by)
            .bind(message_id)
            .execute(&self.pool)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Substring search over subject/from_addr/to_addrs, merged across
    /// both tables and sorted by date descending.
    pub async fn search(
        &self,
        needle: &str,
        fields: &[&str],
        include_sent: bool,
        include_received: bool,
        limit: i64,
    ) -> Result<Vec<SearchHit>> {
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let allowed = ["subject", "from_addr", "to_addrs"];
        let fields: Vec<&str> = fields
            .iter()
            .copied()
            .filter(|f| allowed.contains(f))
            .collect();
        if fields.is_empty() {
            return Ok(Vec::new());
        }

        let clause = fields
            .iter()
            .map(|f| format!("{} LIKE ?", f))
            .collect::<Vec<_>>()
            .join(" OR ");
        let pattern = format!("%{}%", needle);

        let mut hits = Vec::new();

        if include_received {
            let sql = format!(
                "SELECT * FROM emails WHERE ({}) AND is_deleted = 0 AND is_spam = 0 ORDER BY date DESC LIMIT ?",
                clause
            );
            let mut q = sqlx::query(&sql);
            for _ in &fields {
                q = q.bind(&pattern);
            }
            q = q.bind(limit);

            for row in q.fetch_all(&self.pool).await? {
                if let Ok(record) = EmailRecord::from_row(&row) {
                    hits.push(SearchHit {
                        kind: MailboxKind::Received,
                        message_id: record.message_id,
                        from_addr: record.from_addr,
                        to_addrs: record.to_addrs,
                        subject: record.subject,
                        date: record.date,
                    });
                }
            }
        }

        if include_sent {
            let sql = format!(
                "SELECT * FROM sent_emails WHERE ({}) ORDER BY date DESC LIMIT ?",
                clause
            );
            let mut q = sqlx::query(&sql);
            for _ in &fields {
                q = q.bind(&pattern);
            }
            q = q.bind(limit);

            for row in q.fetch_all(&self.pool).await? {
                if let Ok(record) = SentEmailRecord::from_row(&row) {
                    hits.push(SearchHit {
                        kind: MailboxKind::Sent,
                        message_id: record.message_id,
                        from_addr: record.from_addr,
                        to_addrs: record.to_addrs,
                        subject: record.subject,
                        date: record.date,
                    });
                }
            }
        }

        hits.sort_by(|a, b| b.date.cmp(&a.date));
        hits.truncate(limit as usize);

        Ok(hits)
    }
}
