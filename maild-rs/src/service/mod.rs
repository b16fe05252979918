//! Mail service facade.
//!
//! The single entry point for all email CRUD used by the protocol
//! handlers and external collaborators. Hides the split between SQL
//! metadata and `.eml` content, validates and sanitizes ingress
//! payloads, and classifies spam on the save path. Expected failures
//! (validation, unknown ids, denied recalls) surface as `Ok(false)` /
//! `None`; store failures propagate as errors for the handler boundary
//! to translate into protocol responses.

pub mod validator;

pub use validator::{EmailValidator, ValidationReport};

use crate::config::Config;
use crate::error::Result;
use crate::mime::MimeParser;
use crate::spam::KeywordSpamFilter;
use crate::storage::{
    ContentStore, EmailQuery, EmailRecord, EmailRepository, EmailStatusUpdate, SearchHit,
    SentEmailRecord, SentStatusUpdate,
};
use crate::utils::email::extract_address;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

/// An ingress payload before validation.
#[derive(Debug, Clone)]
pub struct IncomingEmail {
    pub message_id: String,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    pub subject: String,
    /// ISO-8601 timestamp.
    pub date: String,
}

/// Attachment metadata exposed at the API boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub filename: Option<String>,
    pub content_type: String,
    pub size: usize,
}

/// Parsed body of a stored email.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentBody {
    pub body: String,
    pub has_attachments: bool,
    pub attachments: Vec<AttachmentInfo>,
}

/// Metadata plus (optionally) the parsed body.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmail {
    pub record: EmailRecord,
    pub content: Option<ContentBody>,
}

pub struct MailService {
    repo: EmailRepository,
    content: ContentStore,
    spam_filter: KeywordSpamFilter,
    recall_window_secs: i64,
}

impl MailService {
    pub fn new(pool: SqlitePool, config: &Config) -> Result<Self> {
        Ok(Self {
            repo: EmailRepository::new(pool),
            content: ContentStore::new(&config.storage.email_dir)?,
            spam_filter: KeywordSpamFilter::new(&config.spam),
            recall_window_secs: config.recall.window_secs as i64,
        })
    }

    /// Persist a received email.
    ///
    /// Runs the full ingress pipeline: validate, sanitize, classify,
    /// write content (deduplicating on Message-ID), insert metadata.
    /// Validation failures return `Ok(false)` without persisting
    /// anything; a metadata write failure rolls back a content file
    /// this call created.
    pub async fn save_email(
        &self,
        email: IncomingEmail,
        plain_text: &str,
        full_eml: &str,
    ) -> Result<bool> {
        let Some(email) = self.validate_and_sanitize(email)? else {
            return Ok(false);
        };

        let verdict = self
            .spam_filter
            .analyze(&email.from_addr, &email.subject, plain_text);
        if verdict.is_spam {
            info!(
                "Classified as spam (score {:.2}): {}",
                verdict.score, email.message_id
            );
        }

        let (content_path, created, size) = self.persist_content(&email.message_id, full_eml).await?;

        let record = EmailRecord {
            message_id: email.message_id.clone(),
            from_addr: email.from_addr,
            to_addrs: email.to_addrs,
            subject: email.subject,
            date: email.date,
            size,
            is_read: false,
            is_deleted: false,
            is_spam: verdict.is_spam,
            spam_score: verdict.score,
            content_path: content_path.clone(),
            is_recalled: false,
            recalled_at: None,
            recalled_by: None,
        };

        match self.repo.insert_email(&record).await {
            Ok(_) => {
                info!("Email saved: {}", email.message_id);
                Ok(true)
            }
            Err(e) => {
                // No partial persistence: drop a content file we created
                if created {
                    if let Err(cleanup) = self
                        .content
                        .remove(&email.message_id, content_path.as_deref())
                        .await
                    {
                        warn!("Failed to roll back content file: {}", cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    /// Persist a sent email into the sent table.
    pub async fn save_sent_email(
        &self,
        email: IncomingEmail,
        cc_addrs: Vec<String>,
        bcc_addrs: Vec<String>,
        plain_text: &str,
        full_eml: &str,
    ) -> Result<bool> {
        let Some(email) = self.validate_and_sanitize(email)? else {
            return Ok(false);
        };

        let verdict = self
            .spam_filter
            .analyze(&email.from_addr, &email.subject, plain_text);

        let (content_path, created, size) = self.persist_content(&email.message_id, full_eml).await?;

        let has_attachments = if full_eml.is_empty() {
            false
        } else {
            MimeParser::parse(full_eml.as_bytes())
                .map(|parsed| !parsed.attachments.is_empty())
                .unwrap_or(false)
        };

        let record = SentEmailRecord {
            message_id: email.message_id.clone(),
            from_addr: email.from_addr,
            to_addrs: email.to_addrs,
            cc_addrs,
            bcc_addrs,
            subject: email.subject,
            date: email.date,
            size,
            has_attachments,
            content_path: content_path.clone(),
            status: "sent".to_string(),
            is_read: false,
            is_spam: verdict.is_spam,
            spam_score: verdict.score,
            is_recalled: false,
            recalled_at: None,
            recalled_by: None,
        };

        match self.repo.insert_sent_email(&record).await {
            Ok(_) => {
                info!("Sent email saved: {}", email.message_id);
                Ok(true)
            }
            Err(e) => {
                if created {
                    if let Err(cleanup) = self
                        .content
                        .remove(&email.message_id, content_path.as_deref())
                        .await
                    {
                        warn!("Failed to roll back content file: {}", cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    fn validate_and_sanitize(&self, email: IncomingEmail) -> Result<Option<IncomingEmail>> {
        let report = EmailValidator::validate(&email);
        if !report.is_valid() {
            error!(
                "Email validation failed for {:?}: {:?}",
                email.message_id, report.errors
            );
            return Ok(None);
        }
        for warning in &report.warnings {
            warn!("Email validation warning: {}", warning);
        }
        Ok(Some(EmailValidator::sanitize(&email)))
    }

    async fn persist_content(
        &self,
        message_id: &str,
        full_eml: &str,
    ) -> Result<(Option<String>, bool, i64)> {
        if full_eml.is_empty() {
            return Ok((None, false, 0));
        }

        let (path, created) = self.content.save(message_id, full_eml).await?;
        let size = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len() as i64)
            .unwrap_or(full_eml.len() as i64);

        Ok((Some(path.to_string_lossy().to_string()), created, size))
    }

    /// Fetch a received email, optionally with its parsed body.
    pub async fn get_email(
        &self,
        message_id: &str,
        include_content: bool,
    ) -> Result<Option<StoredEmail>> {
        let Some(record) = self.repo.get_email(message_id).await? else {
            return Ok(None);
        };

        if !include_content {
            return Ok(Some(StoredEmail {
                record,
                content: None,
            }));
        }

        let content = match self.content.load(message_id, Some(&record)).await {
            Some(raw) => match MimeParser::parse(raw.as_bytes()) {
                Ok(parsed) => ContentBody {
                    body: parsed
                        .html_content
                        .clone()
                        .or(parsed.text_content.clone())
                        .unwrap_or_default(),
                    has_attachments: !parsed.attachments.is_empty(),
                    attachments: parsed
                        .attachments
                        .iter()
                        .map(|a| AttachmentInfo {
                            filename: a.filename.clone(),
                            content_type: a.content_type.clone(),
                            size: a.size,
                        })
                        .collect(),
                },
                Err(e) => {
                    warn!("Failed to parse content for {}: {}", message_id, e);
                    ContentBody {
                        body: raw,
                        has_attachments: false,
                        attachments: Vec::new(),
                    }
                }
            },
            None => ContentBody {
                body: String::new(),
                has_attachments: false,
                attachments: Vec::new(),
            },
        };

        Ok(Some(StoredEmail {
            record,
            content: Some(content),
        }))
    }

    /// Raw `.eml` content for a received email, synthesizing a minimal
    /// envelope from metadata when the file is gone.
    pub async fn get_email_content(&self, message_id: &str) -> Result<Option<String>> {
        let record = self.repo.get_email(message_id).await?;
        Ok(self
            .content
            .load_or_synthesize(message_id, record.as_ref())
            .await)
    }

    pub async fn list_emails(&self, query: &EmailQuery) -> Result<Vec<EmailRecord>> {
        self.repo.list_emails(query).await
    }

    pub async fn list_sent_emails(
        &self,
        from_addr: Option<&str>,
        include_spam: bool,
        is_spam: Option<bool>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SentEmailRecord>> {
        self.repo
            .list_sent_emails(from_addr, include_spam, is_spam, limit, offset)
            .await
    }

    /// Apply a status update, trying the received table first and
    /// falling back to the sent table. Marking an unknown id deleted
    /// still succeeds: the tombstone is idempotent for stateless
    /// callers such as the POP3 UPDATE phase.
    pub async fn update_email(&self, message_id: &str, update: EmailStatusUpdate) -> Result<bool> {
        if self.repo.get_email(message_id).await?.is_some() {
            return self.repo.update_email_status(message_id, &update).await;
        }

        let sent_update = SentStatusUpdate {
            is_read: update.is_read,
            status: None,
        };
        let mut success = false;
        if !sent_update.is_empty() {
            success = self.repo.update_sent_status(message_id, &sent_update).await?;
        }

        if !success && update.is_deleted == Some(true) {
            debug!(
                "Email {} not in the store, delete marker treated as success",
                message_id
            );
            success = true;
        }

        Ok(success)
    }

    pub async fn mark_read(&self, message_id: &str) -> Result<bool> {
        self.update_email(
            message_id,
            EmailStatusUpdate {
                is_read: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    /// Soft delete flips the tombstone; permanent delete removes the
    /// row and unlinks the `.eml` file.
    pub async fn delete_email(&self, message_id: &str, permanent: bool) -> Result<bool> {
        if !permanent {
            return self
                .update_email(
                    message_id,
                    EmailStatusUpdate {
                        is_deleted: Some(true),
                        ..Default::default()
                    },
                )
                .await;
        }

        if let Some(record) = self.repo.get_email(message_id).await? {
            self.content
                .remove(message_id, record.content_path.as_deref())
                .await?;
            return self.repo.delete_email(message_id).await;
        }

        if let Some(record) = self.repo.get_sent_email(message_id).await? {
            self.content
                .remove(message_id, record.content_path.as_deref())
                .await?;
            return self.repo.delete_sent_email(message_id).await;
        }

        Ok(false)
    }

    /// Substring search over subject, sender, and recipients across
    /// both tables, newest first.
    pub async fn search_emails(
        &self,
        needle: &str,
        fields: Option<&[&str]>,
        include_sent: bool,
        include_received: bool,
        limit: i64,
    ) -> Result<Vec<SearchHit>> {
        let default_fields = ["subject", "from_addr", "to_addrs"];
        self.repo
            .search(
                needle,
                fields.unwrap_or(&default_fields),
                include_sent,
                include_received,
                limit,
            )
            .await
    }

    /// Recall a message. Only the original sender may recall, and only
    /// within the configured window of the message date.
    pub async fn recall_email(&self, message_id: &str, actor_email: &str) -> Result<bool> {
        let now = Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();

        if let Some(record) = self.repo.get_email(message_id).await? {
            if !self.can_recall(&record.from_addr, &record.date, actor_email, message_id) {
                return Ok(false);
            }
            return self.repo.recall_email(message_id, actor_email, &now).await;
        }

        if let Some(record) = self.repo.get_sent_email(message_id).await? {
            if !self.can_recall(&record.from_addr, &record.date, actor_email, message_id) {
                return Ok(false);
            }
            return self
                .repo
                .recall_sent_email(message_id, actor_email, &now)
                .await;
        }

        Ok(false)
    }

    fn can_recall(&self, from_addr: &str, date: &str, actor_email: &str, message_id: &str) -> bool {
        let sender = extract_address(from_addr).1;
        if sender != actor_email && from_addr != actor_email {
            warn!(
                "Recall denied for {}: {} is not the sender",
                message_id, actor_email
            );
            return false;
        }

        let Ok(sent_at) = chrono::NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S%.f")
        else {
            warn!("Recall denied for {}: unparseable date {}", message_id, date);
            return false;
        };

        let age = Utc::now().naive_utc() - sent_at;
        if age.num_seconds() > self.recall_window_secs {
            warn!(
                "Recall denied for {}: outside the {}s window",
                message_id, self.recall_window_secs
            );
            return false;
        }

        true
    }
}
