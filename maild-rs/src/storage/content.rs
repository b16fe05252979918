//! Content-addressed `.eml` storage.
//!
//! One file per Message-ID under the configured email directory. Writes
//! are idempotent: `create_new` open semantics skip files that already
//! exist, so concurrent ingresses of the same Message-ID are safe. Reads
//! tolerate a stale `content_path`, falling back to the canonical
//! safe-name path and finally to a directory scan on the ID fragment.

use crate::error::{MailError, Result};
use crate::mime::format::ensure_proper_format;
use crate::storage::types::EmailRecord;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

fn unsafe_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"[\\/*?:"<>|]"#).unwrap())
}

#[derive(Clone)]
pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| MailError::Storage(format!("failed to create email dir: {}", e)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Filesystem-safe transform of a Message-ID: strip `<>`, replace
    /// `@` with `_at_`, replace reserved characters with `_`.
    pub fn safe_filename(message_id: &str) -> String {
        let id = message_id.trim().trim_matches(|c| c == '<' || c == '>');
        let id = id.replace('@', "_at_");
        unsafe_chars().replace_all(&id, "_").trim().to_string()
    }

    /// Canonical path for a Message-ID.
    pub fn path_for(&self, message_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.eml", Self::safe_filename(message_id)))
    }

    /// Save canonicalized content for a Message-ID.
    ///
    /// Returns the file path and whether this call created the file.
    /// When the file already exists the write is skipped and the
    /// existing path is returned, making the store deduplicating per
    /// Message-ID.
    pub async fn save(&self, message_id: &str, content: &str) -> Result<(PathBuf, bool)> {
        let path = self.path_for(message_id);
        let formatted = ensure_proper_format(content);

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(formatted.as_bytes()).await?;
                info!("Stored email content: {}", path.display());
                Ok((path, true))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("Email content already present, skipping: {}", path.display());
                Ok((path, false))
            }
            Err(e) => Err(MailError::Storage(format!(
                "failed to write {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Load content for a Message-ID.
    ///
    /// Resolution order: the metadata's `content_path`, the canonical
    /// safe-name path, then a directory scan matching the ID fragment.
    pub async fn load(
        &self,
        message_id: &str,
        metadata: Option<&EmailRecord>,
    ) -> Option<String> {
        if let Some(record) = metadata {
            if let Some(content_path) = &record.content_path {
                if let Some(content) = Self::read_file(Path::new(content_path)).await {
                    return Some(content);
                }
            }
        }

        let canonical = self.path_for(message_id);
        if let Some(content) = Self::read_file(&canonical).await {
            return Some(content);
        }

        self.scan_for(message_id).await
    }

    /// Load content, or rebuild a minimal envelope from metadata when
    /// every resolution strategy fails.
    pub async fn load_or_synthesize(
        &self,
        message_id: &str,
        metadata: Option<&EmailRecord>,
    ) -> Option<String> {
        if let Some(content) = self.load(message_id, metadata).await {
            return Some(content);
        }

        let record = metadata?;
        warn!(
            "Content missing for {}, synthesizing envelope from metadata",
            message_id
        );
        Some(crate::mime::format::minimal_envelope(
            &record.message_id,
            &record.from_addr,
            &record.to_addrs,
            &record.subject,
            &record.date,
        ))
    }

    /// Unlink the `.eml` file for a Message-ID (used by hard delete).
    pub async fn remove(&self, message_id: &str, content_path: Option<&str>) -> Result<()> {
        let path = match content_path {
            Some(p) if Path::new(p).exists() => PathBuf::from(p),
            _ => self.path_for(message_id),
        };

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("Removed email content: {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MailError::Storage(format!(
                "failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn read_file(path: &Path) -> Option<String> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Scan the storage directory for a file containing the local part
    /// of the Message-ID.
    async fn scan_for(&self, message_id: &str) -> Option<String> {
        let fragment = message_id
            .trim_matches(|c| c == '<' || c == '>')
            .split('@')
            .next()?
            .to_string();
        if fragment.is_empty() {
            return None;
        }

        let mut entries = tokio::fs::read_dir(&self.dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".eml") && name.contains(&fragment) {
                if let Some(content) = Self::read_file(&entry.path()).await {
                    debug!("Resolved {} by directory scan: {}", message_id, name);
                    return Some(content);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_filename() {
        assert_eq!(ContentStore::safe_filename("<abc@host>"), "abc_at_host");
        assert_eq!(
            ContentStore::safe_filename("<we/ird?id@h:ost>"),
            "we_ird_id_at_h_ost"
        );
        assert_eq!(ContentStore::safe_filename("plain@h"), "plain_at_h");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();

        let content = "Subject: hi\nFrom: a@b.com\n\nbody\n";
        let (path, created) = store.save("<msg1@host>", content).await.unwrap();
        assert!(path.exists());
        assert!(created);

        let loaded = store.load("<msg1@host>", None).await.unwrap();
        assert!(loaded.contains("Subject: hi"));
        assert!(loaded.contains("body"));
    }

    #[tokio::test]
    async fn test_save_is_deduplicating() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();

        let (first, created) = store.save("<dup@h>", "Subject: one\n\nfirst\n").await.unwrap();
        let (second, created_again) = store.save("<dup@h>", "Subject: two\n\nsecond\n").await.unwrap();
        assert_eq!(first, second);
        assert!(created);
        assert!(!created_again);

        // First write wins
        let loaded = store.load("<dup@h>", None).await.unwrap();
        assert!(loaded.contains("first"));
        assert!(!loaded.contains("second"));
    }

    #[tokio::test]
    async fn test_load_via_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();

        // A file whose name carries extra suffix still resolves by fragment
        tokio::fs::write(
            dir.path().join("scanme_at_host.extra.eml"),
            "Subject: found\n\nvia scan\n",
        )
        .await
        .unwrap();

        let loaded = store.load("<scanme@host>", None).await.unwrap();
        assert!(loaded.contains("via scan"));
    }

    #[tokio::test]
    async fn test_synthesized_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();

        let record = EmailRecord {
            message_id: "<gone@h>".to_string(),
            from_addr: "a@b.com".to_string(),
            to_addrs: vec!["c@d.com".to_string()],
            subject: "lost".to_string(),
            date: "2025-07-01T10:00:00".to_string(),
            size: 0,
            is_read: false,
            is_deleted: false,
            is_spam: false,
            spam_score: 0.0,
            content_path: None,
            is_recalled: false,
            recalled_at: None,
            recalled_by: None,
        };

        let content = store
            .load_or_synthesize("<gone@h>", Some(&record))
            .await
            .unwrap();
        assert!(content.contains("Message-ID: <gone@h>"));
        assert!(content.contains("Subject: lost"));
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();
        store.remove("<never@h>", None).await.unwrap();
    }
}
