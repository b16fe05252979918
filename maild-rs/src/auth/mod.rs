//! User accounts and credential verification.
//!
//! Passwords are hashed with PBKDF2-HMAC-SHA256 (100 000 iterations,
//! 16-byte per-user salt, 32-byte output); verification goes through
//! `ring::pbkdf2::verify`, which compares in constant time. Salt and hash
//! are stored hex-encoded. All operations run against the shared pool;
//! hashes are never cached in memory.

use crate::error::{MailError, Result};
use crate::storage::with_busy_retry;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use data_encoding::HEXLOWER;
use rand::RngCore;
use ring::pbkdf2;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::num::NonZeroU32;
use tracing::{debug, info, warn};

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(100_000) {
    Some(n) => n,
    None => unreachable!(),
};

/// SMTP authentication mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// PLAIN mechanism (RFC 4616)
    Plain,
    /// LOGIN mechanism
    Login,
}

impl AuthMechanism {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// A persistent user record.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub salt: String,
    pub full_name: String,
    pub is_active: bool,
    pub created_at: String,
    pub last_login: Option<String>,
}

impl User {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            salt: row.try_get("salt")?,
            full_name: row.try_get("full_name")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            last_login: row.try_get("last_login")?,
        })
    }
}

#[derive(Clone)]
pub struct AuthService {
    pool: SqlitePool,
}

impl AuthService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new user. Fails when the username or email is taken.
    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password: &str,
        full_name: Option<&str>,
    ) -> Result<User> {
        if self.get_user_by_username(username).await?.is_some() {
            return Err(MailError::Validation(format!(
                "username already exists: {}",
                username
            )));
        }
        if self.get_user_by_email(email).await?.is_some() {
            return Err(MailError::Validation(format!(
                "email already exists: {}",
                email
            )));
        }

        let (password_hash, salt) = Self::hash_password(password);
        let user = User {
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            salt,
            full_name: full_name.unwrap_or("").to_string(),
            is_active: true,
            created_at: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            last_login: None,
        };

        with_busy_retry(|| {
            sqlx::query(
                r#"
                INSERT INTO users (
                    username, email, password_hash, salt, full_name,
                    is_active, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.salt)
            .bind(&user.full_name)
            .bind(user.is_active)
            .bind(&user.created_at)
            .execute(&self.pool)
        })
        .await?;

        info!("User created: {}", username);
        Ok(user)
    }

    /// Verify credentials. Returns the user record on success; an
    /// unknown user, an inactive account, and a bad password all
    /// collapse into `None` for the caller.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>> {
        let Some(user) = self.get_user_by_username(username).await? else {
            warn!("Authentication failed: user not found: {}", username);
            return Ok(None);
        };

        if !user.is_active {
            warn!("Authentication failed: user inactive: {}", username);
            return Ok(None);
        }

        if !Self::verify_password(password, &user.password_hash, &user.salt) {
            warn!("Authentication failed: invalid password for {}", username);
            return Ok(None);
        }

        self.update_last_login(username).await?;
        info!("Authentication successful for {}", username);
        Ok(Some(user))
    }

    /// Resolve a POP3 login to a mailbox: authenticate by username, and
    /// when the supplied name looks like an address, fall back to a
    /// lookup by email.
    pub async fn resolve_mailbox(&self, login: &str, password: &str) -> Result<Option<User>> {
        if let Some(user) = self.authenticate(login, password).await? {
            return Ok(Some(user));
        }

        if login.contains('@') {
            if let Some(user) = self.get_user_by_email(login).await? {
                return self.authenticate(&user.username, password).await;
            }
        }

        Ok(None)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| User::from_row(&r)).transpose().map_err(Into::into)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| User::from_row(&r)).transpose().map_err(Into::into)
    }

    /// Replace hash and salt in one statement.
    pub async fn change_password(&self, username: &str, new_password: &str) -> Result<bool> {
        let (password_hash, salt) = Self::hash_password(new_password);

        let result = with_busy_retry(|| {
            sqlx::query("UPDATE users SET password_hash = ?, salt = ? WHERE username = ?")
                .bind(&password_hash)
                .bind(&salt)
                .bind(username)
                .execute(&self.pool)
        })
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            info!("Password changed for {}", username);
        }
        Ok(changed)
    }

    pub async fn deactivate_user(&self, username: &str) -> Result<bool> {
        self.set_active(username, false).await
    }

    pub async fn activate_user(&self, username: &str) -> Result<bool> {
        self.set_active(username, true).await
    }

    async fn set_active(&self, username: &str, active: bool) -> Result<bool> {
        let result = with_busy_retry(|| {
            sqlx::query("UPDATE users SET is_active = ? WHERE username = ?")
                .bind(active)
                .bind(username)
                .execute(&self.pool)
        })
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            info!(
                "User {}: {}",
                if active { "activated" } else { "deactivated" },
                username
            );
        }
        Ok(changed)
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY username")
            .fetch_all(&self.pool)
            .await?;

        let mut users = Vec::with_capacity(rows.len());
        for row in &rows {
            users.push(User::from_row(row)?);
        }
        Ok(users)
    }

    async fn update_last_login(&self, username: &str) -> Result<()> {
        let now = Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
        with_busy_retry(|| {
            sqlx::query("UPDATE users SET last_login = ? WHERE username = ?")
                .bind(&now)
                .bind(username)
                .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    /// Derive a PBKDF2 hash with a fresh random salt. Returns
    /// `(hash_hex, salt_hex)`.
    pub fn hash_password(password: &str) -> (String, String) {
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let mut hash = [0u8; HASH_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            PBKDF2_ITERATIONS,
            &salt,
            password.as_bytes(),
            &mut hash,
        );

        (HEXLOWER.encode(&hash), HEXLOWER.encode(&salt))
    }

    /// Recompute the hash with the stored salt and compare in constant
    /// time.
    pub fn verify_password(password: &str, hash_hex: &str, salt_hex: &str) -> bool {
        let Ok(hash) = HEXLOWER.decode(hash_hex.as_bytes()) else {
            return false;
        };
        let Ok(salt) = HEXLOWER.decode(salt_hex.as_bytes()) else {
            return false;
        };

        pbkdf2::verify(
            pbkdf2::PBKDF2_HMAC_SHA256,
            PBKDF2_ITERATIONS,
            &salt,
            password.as_bytes(),
            &hash,
        )
        .is_ok()
    }

    /// Decode PLAIN authentication data.
    ///
    /// Accepts both `\0username\0password` and `username\0password`
    /// (base64 encoded).
    pub fn decode_plain_auth(auth_data: &str) -> Result<(String, String)> {
        let decoded = BASE64
            .decode(auth_data.trim())
            .map_err(|e| MailError::SmtpProtocol(format!("Invalid base64: {}", e)))?;

        let text = std::str::from_utf8(&decoded)
            .map_err(|e| MailError::SmtpProtocol(format!("Invalid UTF-8: {}", e)))?;
        let parts: Vec<&str> = text.split('\0').collect();

        let (username, password) = match parts.len() {
            3 => (parts[1], parts[2]),
            2 => (parts[0], parts[1]),
            _ => {
                return Err(MailError::SmtpProtocol(
                    "Invalid PLAIN auth format".to_string(),
                ))
            }
        };

        debug!("Decoded PLAIN credentials for {}", username);
        Ok((username.to_string(), password.to_string()))
    }

    /// Decode one step of LOGIN authentication (base64 username or
    /// password).
    pub fn decode_login_credential(credential: &str) -> Result<String> {
        let decoded = BASE64
            .decode(credential.trim())
            .map_err(|e| MailError::SmtpProtocol(format!("Invalid base64: {}", e)))?;

        String::from_utf8(decoded)
            .map_err(|e| MailError::SmtpProtocol(format!("Invalid UTF-8: {}", e)))
    }
}
