use crate::error::{MailError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Immutable runtime configuration.
///
/// Built once at startup and passed explicitly to each subsystem.
/// Resolution order for listener ports: CLI argument > environment
/// variable > JSON configuration file > built-in default. CLI overrides
/// are applied by the binary after [`Config::load`] returns.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpConfig,
    pub pop3: Pop3Config,
    pub tls: TlsSettings,
    pub storage: StorageConfig,
    pub spam: SpamSettings,
    pub recall: RecallConfig,
    pub shutdown: ShutdownConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub domain: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub ssl_port: u16,
    pub use_ssl: bool,
    pub require_auth: bool,
    pub max_connections: usize,
    pub max_message_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Pop3Config {
    pub host: String,
    pub port: u16,
    pub ssl_port: u16,
    pub use_ssl: bool,
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsSettings {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: String,
    pub email_dir: String,
    pub db_pool_size: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SpamSettings {
    pub keywords: Vec<String>,
    pub suspicious_senders: Vec<String>,
    pub threshold: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecallConfig {
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub graceful_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            hostname: "mail.localhost".to_string(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8025,
            ssl_port: 465,
            use_ssl: true,
            require_auth: true,
            max_connections: 200,
            max_message_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl Default for Pop3Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8110,
            ssl_port: 995,
            use_ssl: true,
            max_connections: 200,
            idle_timeout_secs: 300,
        }
    }
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert_file: "certs/server.crt".to_string(),
            key_file: "certs/server.key".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "data/mail.db".to_string(),
            email_dir: "data/emails".to_string(),
            db_pool_size: 30,
        }
    }
}

impl Default for SpamSettings {
    fn default() -> Self {
        Self {
            keywords: [
                "free",
                "prize",
                "lottery",
                "winner",
                "viagra",
                "casino",
                "urgent",
                "act now",
                "click here",
                "million dollar",
                "免费",
                "中奖",
                "促销",
                "优惠",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            suspicious_senders: vec![
                r"^noreply@".to_string(),
                r"^promo(tion)?s?@".to_string(),
                r"^\d{6,}@".to_string(),
            ],
            threshold: 0.7,
        }
    }
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self { window_secs: 3600 }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_secs: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            smtp: SmtpConfig::default(),
            pop3: Pop3Config::default(),
            tls: TlsSettings::default(),
            storage: StorageConfig::default(),
            spam: SpamSettings::default(),
            recall: RecallConfig::default(),
            shutdown: ShutdownConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, then apply environment
    /// overrides. A missing file yields the built-in defaults.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.as_ref().exists() => Self::from_file(p)?,
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MailError::Config(format!("failed to read config file: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| MailError::Config(format!("failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides on top of file/default values.
    pub fn apply_env(&mut self) {
        env_parse("SMTP_PORT", &mut self.smtp.port);
        env_parse("SMTP_SSL_PORT", &mut self.smtp.ssl_port);
        env_parse("POP3_PORT", &mut self.pop3.port);
        env_parse("POP3_SSL_PORT", &mut self.pop3.ssl_port);
        env_parse("MAX_CONNECTIONS", &mut self.smtp.max_connections);
        env_parse("MAX_CONNECTIONS", &mut self.pop3.max_connections);
        env_parse("DB_CONNECTION_POOL_SIZE", &mut self.storage.db_pool_size);
        env_parse("SPAM_THRESHOLD", &mut self.spam.threshold);
        env_parse("CONNECTION_IDLE_TIMEOUT", &mut self.pop3.idle_timeout_secs);
        env_parse(
            "GRACEFUL_SHUTDOWN_TIMEOUT",
            &mut self.shutdown.graceful_timeout_secs,
        );

        if let Ok(v) = std::env::var("AUTH_REQUIRED") {
            self.smtp.require_auth = v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("EMAIL_STORAGE_DIR") {
            self.storage.email_dir = v;
        }
        if let Ok(v) = std::env::var("SPAM_KEYWORDS") {
            self.spam.keywords = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(v) = std::env::var(name) {
        if let Ok(parsed) = v.parse::<T>() {
            *target = parsed;
        }
    }
}
