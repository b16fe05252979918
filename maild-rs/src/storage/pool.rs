//! Shared SQLite connection pool.
//!
//! One pool serves both protocol servers and the auth service. Each
//! connection runs with WAL journaling and a short driver-level busy
//! timeout; on top of that, write operations go through
//! [`with_busy_retry`], an application-level backoff loop for
//! `database is locked` errors.

use crate::error::Result;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Maximum retries for a busy database before giving up.
const BUSY_MAX_RETRIES: u32 = 5;

/// First backoff step; doubles per retry up to [`BUSY_MAX_WAIT`].
const BUSY_INITIAL_WAIT: Duration = Duration::from_millis(25);

/// Backoff ceiling.
const BUSY_MAX_WAIT: Duration = Duration::from_millis(500);

/// Open the shared pool and create the schema.
pub async fn connect_pool(database_path: &str, pool_size: u32) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(database_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(database_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(1))
        .pragma("cache_size", "2000")
        .pragma("temp_store", "MEMORY");

    let pool = SqlitePoolOptions::new()
        .max_connections(pool_size)
        .test_before_acquire(true)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;

    info!(
        "Database pool ready: {} ({} connections)",
        database_path, pool_size
    );

    Ok(pool)
}

/// Create tables and indexes idempotently.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS users (
            username TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            salt TEXT NOT NULL,
            full_name TEXT NOT NULL DEFAULT '',
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            last_login TEXT,
            smtp_host TEXT,
            smtp_port INTEGER,
            smtp_use_tls INTEGER,
            smtp_password_enc TEXT,
            pop3_host TEXT,
            pop3_port INTEGER,
            pop3_use_tls INTEGER,
            pop3_password_enc TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS emails (
            message_id TEXT PRIMARY KEY,
            from_addr TEXT NOT NULL,
            to_addrs TEXT NOT NULL,
            subject TEXT NOT NULL DEFAULT '',
            date TEXT NOT NULL,
            size INTEGER NOT NULL DEFAULT 0,
            is_read INTEGER NOT NULL DEFAULT 0,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            is_spam INTEGER NOT NULL DEFAULT 0,
            spam_score REAL NOT NULL DEFAULT 0.0,
            content_path TEXT,
            is_recalled INTEGER NOT NULL DEFAULT 0,
            recalled_at TEXT,
            recalled_by TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sent_emails (
            message_id TEXT PRIMARY KEY,
            from_addr TEXT NOT NULL,
            to_addrs TEXT NOT NULL,
            cc_addrs TEXT,
            bcc_addrs TEXT,
            subject TEXT NOT NULL DEFAULT '',
            date TEXT NOT NULL,
            size INTEGER NOT NULL DEFAULT 0,
            has_attachments INTEGER NOT NULL DEFAULT 0,
            content_path TEXT,
            status TEXT NOT NULL DEFAULT 'sent',
            is_read INTEGER NOT NULL DEFAULT 0,
            is_spam INTEGER NOT NULL DEFAULT 0,
            spam_score REAL NOT NULL DEFAULT 0.0,
            is_recalled INTEGER NOT NULL DEFAULT 0,
            recalled_at TEXT,
            recalled_by TEXT
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_emails_date ON emails(date)",
        "CREATE INDEX IF NOT EXISTS idx_emails_from_addr ON emails(from_addr)",
        "CREATE INDEX IF NOT EXISTS idx_sent_emails_date ON sent_emails(date)",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    debug!("Database schema ready");
    Ok(())
}

/// Retry an operation while SQLite reports the database as locked.
///
/// Exponential backoff starting at 25ms, capped at 500ms, at most
/// [`BUSY_MAX_RETRIES`] retries.
pub async fn with_busy_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut wait = BUSY_INITIAL_WAIT;
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_busy_error(&e) && attempt < BUSY_MAX_RETRIES => {
                attempt += 1;
                warn!(
                    "Database busy, retrying in {:?} (attempt {}/{})",
                    wait, attempt, BUSY_MAX_RETRIES
                );
                sleep(wait).await;
                wait = (wait * 2).min(BUSY_MAX_WAIT);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn is_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            let message = db.message().to_lowercase();
            message.contains("database is locked") || message.contains("database table is locked")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let pool = connect_pool(db_path.to_str().unwrap(), 2).await.unwrap();

        // Schema creation is idempotent
        init_schema(&pool).await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM emails")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_busy_retry_passes_through_other_errors() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let pool = connect_pool(db_path.to_str().unwrap(), 2).await.unwrap();

        let result =
            with_busy_retry(|| sqlx::query("SELECT * FROM no_such_table").execute(&pool)).await;
        assert!(result.is_err());
    }
}
