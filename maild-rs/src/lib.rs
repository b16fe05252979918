//! maild-rs: dual-protocol SMTP/POP3 mail server
//!
//! An SMTP submission server and a POP3 retrieval server sharing one
//! persistent mail store.
//!
//! # Features
//!
//! - **SMTP server**: RFC 5321 subset with AUTH PLAIN/LOGIN and
//!   implicit TLS, feeding accepted envelopes into the store
//! - **POP3 server**: RFC 1939 three-state sessions with deferred
//!   deletion semantics
//! - **Mail store**: SQLite metadata plus content-addressed `.eml`
//!   files, deduplicating on Message-ID
//! - **Spam filter**: deterministic keyword scoring applied on ingress
//!
//! # Example
//!
//! ```no_run
//! use maild_rs::auth::AuthService;
//! use maild_rs::config::Config;
//! use maild_rs::net::Shutdown;
//! use maild_rs::service::MailService;
//! use maild_rs::smtp::SmtpServer;
//! use maild_rs::storage::connect_pool;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(Config::default());
//!     let pool = connect_pool(&config.storage.database_path, config.storage.db_pool_size).await?;
//!
//!     let mail_service = Arc::new(MailService::new(pool.clone(), &config)?);
//!     let auth = Arc::new(AuthService::new(pool));
//!
//!     let server = SmtpServer::new(config, mail_service, auth, None, Shutdown::new());
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`error`]: Error types and handling
//! - [`smtp`]: SMTP protocol implementation
//! - [`pop3`]: POP3 protocol implementation
//! - [`service`]: Mail service facade over the store
//! - [`storage`]: Metadata repository and content store
//! - [`auth`]: User accounts and credential verification
//! - [`spam`]: Keyword spam classifier
//! - [`mime`]: RFC 5322 parsing and canonical serialization
//! - [`security`]: TLS configuration
//! - [`net`]: Connection limits, socket tuning, graceful shutdown

pub mod auth;
pub mod config;
pub mod error;
pub mod mime;
pub mod net;
pub mod pop3;
pub mod security;
pub mod service;
pub mod smtp;
pub mod spam;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{MailError, Result};
