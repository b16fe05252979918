//! SMTP submission server (RFC 5321 subset).

pub mod commands;
pub mod server;
pub mod session;

pub use commands::SmtpCommand;
pub use server::SmtpServer;
pub use session::SmtpSession;
