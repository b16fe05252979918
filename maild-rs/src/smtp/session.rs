//! Per-connection SMTP session.
//!
//! One session owns one connection's envelope state; nothing is shared
//! across connections. The authenticated flag lives on the session
//! itself. Commands are processed strictly in order; AUTH and the DATA
//! body are the only points where the session reads extra lines.

use crate::auth::{AuthMechanism, AuthService};
use crate::error::{MailError, Result};
use crate::mime::format::{ensure_proper_format, set_header};
use crate::mime::{EmailAddress, MimeParser};
use crate::service::{IncomingEmail, MailService};
use crate::smtp::commands::SmtpCommand;
use crate::utils::email::validate_email;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Maximum number of recipients per message
const MAX_RECIPIENTS: usize = 100;

/// Maximum line length in SMTP protocol (RFC 5321)
const MAX_LINE_LENGTH: usize = 1000;

/// Idle timeout between commands
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-read timeout inside the DATA phase
const DATA_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of errors before disconnecting
const MAX_ERRORS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    /// Banner sent, waiting for EHLO/HELO
    Fresh,
    /// Peer identified via EHLO/HELO
    Identified,
    /// Envelope has a sender
    MailFrom,
    /// Envelope has at least one recipient
    RcptTo,
    /// Reading message body
    Data,
}

/// Outcome of the DATA body read loop.
enum DataOutcome {
    Complete,
    TooLarge,
    TimedOut,
    Closed,
}

pub struct SmtpSession {
    state: SmtpState,
    mail_from: Option<String>,
    rcpt_tos: Vec<String>,
    data: Vec<u8>,
    hostname: String,
    mail_service: Arc<MailService>,
    auth: Arc<AuthService>,
    require_auth: bool,
    max_message_size: usize,
    authenticated_user: Option<String>,
    error_count: usize,
}

impl SmtpSession {
    pub fn new(
        hostname: String,
        mail_service: Arc<MailService>,
        auth: Arc<AuthService>,
        require_auth: bool,
        max_message_size: usize,
    ) -> Self {
        Self {
            state: SmtpState::Fresh,
            mail_from: None,
            rcpt_tos: Vec::new(),
            data: Vec::new(),
            hostname,
            mail_service,
            auth,
            require_auth,
            max_message_size,
            authenticated_user: None,
            error_count: 0,
        }
    }

    pub fn state(&self) -> SmtpState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated_user.is_some()
    }

    /// Drive the session over an accepted (possibly TLS-wrapped) stream.
    pub async fn handle<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(stream);

        reader
            .write_all(format!("220 {} ESMTP Service Ready\r\n", self.hostname).as_bytes())
            .await?;

        let mut line = String::new();

        loop {
            if self.error_count >= MAX_ERRORS {
                warn!("Too many errors, disconnecting");
                reader
                    .write_all(b"421 Too many errors, closing connection\r\n")
                    .await?;
                return Ok(());
            }

            line.clear();

            let n = match timeout(COMMAND_TIMEOUT, reader.read_line(&mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!("IO error reading command: {}", e);
                    return Err(e.into());
                }
                Err(_) => {
                    warn!("Command timeout, disconnecting");
                    reader
                        .write_all(b"421 Timeout, closing connection\r\n")
                        .await?;
                    return Ok(());
                }
            };

            if n == 0 {
                debug!("Client disconnected");
                return Ok(());
            }

            if line.len() > MAX_LINE_LENGTH {
                warn!("Command line too long: {} bytes", line.len());
                reader.write_all(b"500 Line too long\r\n").await?;
                self.error_count += 1;
                continue;
            }

            let trimmed = line.trim_end();
            debug!("SMTP <- {}", trimmed);

            match SmtpCommand::parse(trimmed) {
                Ok(SmtpCommand::Auth(mechanism, initial_response)) => {
                    if let Err(e) = self
                        .handle_auth(&mechanism, initial_response, &mut reader)
                        .await
                    {
                        error!("AUTH error: {}", e);
                        reader.write_all(b"535 Authentication failed\r\n").await?;
                        self.error_count += 1;
                    }
                }
                Ok(cmd) => {
                    let response = self.handle_command(cmd);
                    reader.write_all(response.as_bytes()).await?;

                    if response.starts_with("221") {
                        return Ok(());
                    }
                    if response.starts_with("5") {
                        self.error_count += 1;
                    }

                    if self.state == SmtpState::Data {
                        match self.receive_data(&mut reader).await? {
                            DataOutcome::Complete => {
                                let reply = match self.process_envelope().await {
                                    Ok(true) => "250 Message accepted for delivery\r\n",
                                    Ok(false) => {
                                        warn!("Envelope rejected by validation");
                                        self.error_count += 1;
                                        "451 Requested action aborted: error in processing\r\n"
                                    }
                                    Err(e) => {
                                        error!("Error processing envelope: {}", e);
                                        self.error_count += 1;
                                        "451 Requested action aborted: error in processing\r\n"
                                    }
                                };
                                reader.write_all(reply.as_bytes()).await?;
                                self.reset_envelope();
                                self.state = SmtpState::Identified;
                            }
                            DataOutcome::TooLarge => {
                                warn!("Message exceeds {} bytes", self.max_message_size);
                                reader
                                    .write_all(
                                        b"451 Requested action aborted: message too large\r\n",
                                    )
                                    .await?;
                                return Ok(());
                            }
                            DataOutcome::TimedOut => {
                                warn!("DATA timeout, disconnecting");
                                reader
                                    .write_all(b"421 Timeout, closing connection\r\n")
                                    .await?;
                                return Ok(());
                            }
                            DataOutcome::Closed => {
                                debug!("Connection closed during DATA");
                                return Ok(());
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("Command parse error: {}", e);
                    reader.write_all(b"500 Unrecognized command\r\n").await?;
                    self.error_count += 1;
                }
            }
        }
    }

    /// Pure command/state transition; AUTH and DATA body handling live
    /// in the read loop.
    pub fn handle_command(&mut self, cmd: SmtpCommand) -> String {
        match (self.state, cmd) {
            (SmtpState::Fresh, SmtpCommand::Helo(domain)) => {
                info!("HELO from {}", domain);
                self.state = SmtpState::Identified;
                format!("250 {} Hello {}\r\n", self.hostname, domain)
            }
            (SmtpState::Fresh, SmtpCommand::Ehlo(domain)) => {
                info!("EHLO from {}", domain);
                self.state = SmtpState::Identified;
                format!(
                    "250-{} Hello {}\r\n250-SIZE {}\r\n250-AUTH PLAIN LOGIN\r\n250 HELP\r\n",
                    self.hostname, domain, self.max_message_size
                )
            }
            (SmtpState::Identified, SmtpCommand::MailFrom(from)) => {
                if self.require_auth && self.authenticated_user.is_none() {
                    warn!("MAIL FROM rejected: authentication required");
                    return "530 Authentication required\r\n".to_string();
                }

                if let Err(e) = validate_email(&from) {
                    warn!("MAIL FROM rejected: {}", e);
                    return "500 Invalid address\r\n".to_string();
                }

                info!("MAIL FROM: {}", from);
                self.mail_from = Some(from);
                self.rcpt_tos.clear();
                self.data.clear();
                self.state = SmtpState::MailFrom;
                "250 OK\r\n".to_string()
            }
            (SmtpState::MailFrom | SmtpState::RcptTo, SmtpCommand::RcptTo(to)) => {
                if let Err(e) = validate_email(&to) {
                    warn!("RCPT TO rejected: {}", e);
                    return "500 Invalid address\r\n".to_string();
                }

                if self.rcpt_tos.len() >= MAX_RECIPIENTS {
                    warn!("Too many recipients: {}", self.rcpt_tos.len());
                    return format!("452 Too many recipients (max {})\r\n", MAX_RECIPIENTS);
                }

                info!("RCPT TO: {}", to);
                self.rcpt_tos.push(to);
                self.state = SmtpState::RcptTo;
                "250 OK\r\n".to_string()
            }
            (SmtpState::RcptTo, SmtpCommand::Data) => {
                self.state = SmtpState::Data;
                "354 Start mail input; end with <CRLF>.<CRLF>\r\n".to_string()
            }
            (SmtpState::MailFrom, SmtpCommand::Data) => {
                "503 Error: need RCPT command\r\n".to_string()
            }
            (SmtpState::Identified, SmtpCommand::Data | SmtpCommand::RcptTo(_)) => {
                "503 Error: need MAIL command\r\n".to_string()
            }
            (_, SmtpCommand::Rset) => {
                self.reset_envelope();
                if self.state != SmtpState::Fresh {
                    self.state = SmtpState::Identified;
                }
                "250 OK\r\n".to_string()
            }
            (_, SmtpCommand::Noop) => "250 OK\r\n".to_string(),
            (_, SmtpCommand::Quit) => {
                format!("221 {} closing connection\r\n", self.hostname)
            }
            (_, SmtpCommand::Unknown(cmd)) => {
                debug!("Unknown command: {}", cmd);
                "500 Unrecognized command\r\n".to_string()
            }
            _ => "503 Bad sequence of commands\r\n".to_string(),
        }
    }

    fn reset_envelope(&mut self) {
        self.mail_from = None;
        self.rcpt_tos.clear();
        self.data.clear();
    }

    /// Read the DATA body until the terminating `.` line, reversing
    /// dot-stuffing and enforcing the size cap.
    async fn receive_data<S>(&mut self, reader: &mut BufReader<S>) -> Result<DataOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut line = String::new();

        loop {
            line.clear();

            let n = match timeout(DATA_READ_TIMEOUT, reader.read_line(&mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!("IO error during DATA: {}", e);
                    return Err(e.into());
                }
                Err(_) => return Ok(DataOutcome::TimedOut),
            };

            if n == 0 {
                return Ok(DataOutcome::Closed);
            }

            if line.trim_end() == "." {
                debug!("End of DATA, {} bytes", self.data.len());
                return Ok(DataOutcome::Complete);
            }

            if self.data.len() + line.len() > self.max_message_size {
                return Ok(DataOutcome::TooLarge);
            }

            // Reverse dot-stuffing
            if line.starts_with("..") {
                self.data.extend_from_slice(&line.as_bytes()[1..]);
            } else {
                self.data.extend_from_slice(line.as_bytes());
            }
        }
    }

    /// Ingress pipeline for a completed envelope.
    ///
    /// Parses the body, repairs From/Message-ID against the envelope,
    /// canonicalizes the stored bytes, and hands the result to the mail
    /// service (which validates and classifies). Returns `Ok(false)`
    /// when the service rejected the payload.
    async fn process_envelope(&mut self) -> Result<bool> {
        let mail_from = self
            .mail_from
            .clone()
            .ok_or_else(|| MailError::SmtpProtocol("No sender specified".to_string()))?;

        if self.data.is_empty() {
            return Err(MailError::SmtpProtocol("Empty message".to_string()));
        }

        let mut content = String::from_utf8_lossy(&self.data).to_string();
        let mut parsed = MimeParser::parse(content.as_bytes())?;

        // Prefer the envelope sender when the header is missing or the
        // parser's sentinel
        if parsed.from_addr.is_unknown() {
            info!("Repairing From header from envelope: {}", mail_from);
            content = set_header(&content, "From", &mail_from);
            parsed.from_addr = EmailAddress::new("", mail_from.clone());
        }

        let raw_id = parsed.message_id.trim();
        let message_id = if raw_id.is_empty()
            || raw_id == "unknown@localhost"
            || raw_id == "<unknown@localhost>"
        {
            let new_id = format!("<{}@{}>", Uuid::new_v4(), self.hostname);
            info!("Synthesized Message-ID: {}", new_id);
            content = set_header(&content, "Message-ID", &new_id);
            new_id
        } else {
            raw_id.to_string()
        };

        let canonical = ensure_proper_format(&content);
        let plain_text = parsed.plain_text();

        let subject = if parsed.subject.is_empty() {
            "(no subject)".to_string()
        } else {
            parsed.subject.clone()
        };

        let date = parsed
            .date
            .map(|d| d.naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string())
            .unwrap_or_else(|| Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string());

        let incoming = IncomingEmail {
            message_id,
            from_addr: parsed.from_addr.address.clone(),
            to_addrs: self.rcpt_tos.clone(),
            subject,
            date,
        };

        self.mail_service
            .save_email(incoming, &plain_text, &canonical)
            .await
    }

    /// AUTH PLAIN / AUTH LOGIN exchange.
    async fn handle_auth<S>(
        &mut self,
        mechanism: &str,
        initial_response: Option<String>,
        reader: &mut BufReader<S>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.authenticated_user.is_some() {
            reader.write_all(b"503 Already authenticated\r\n").await?;
            return Ok(());
        }

        if self.state != SmtpState::Identified {
            reader
                .write_all(b"503 Bad sequence of commands\r\n")
                .await?;
            return Ok(());
        }

        let Some(auth_mechanism) = AuthMechanism::from_str(mechanism) else {
            reader
                .write_all(b"504 Authentication mechanism not supported\r\n")
                .await?;
            return Ok(());
        };

        info!("AUTH {} initiated", auth_mechanism.as_str());

        let (username, password) = match auth_mechanism {
            AuthMechanism::Plain => {
                let auth_data = match initial_response {
                    Some(data) => data,
                    None => {
                        reader.write_all(b"334 \r\n").await?;
                        self.read_auth_line(reader).await?
                    }
                };
                AuthService::decode_plain_auth(&auth_data)?
            }
            AuthMechanism::Login => {
                // base64 "Username:"
                reader.write_all(b"334 VXNlcm5hbWU6\r\n").await?;
                let username = AuthService::decode_login_credential(&self.read_auth_line(reader).await?)?;

                // base64 "Password:"
                reader.write_all(b"334 UGFzc3dvcmQ6\r\n").await?;
                let password = AuthService::decode_login_credential(&self.read_auth_line(reader).await?)?;

                (username, password)
            }
        };

        if username.is_empty() || password.is_empty() {
            warn!("AUTH rejected: blank credentials");
            reader.write_all(b"535 Authentication failed\r\n").await?;
            self.error_count += 1;
            return Ok(());
        }

        match self.auth.authenticate(&username, &password).await? {
            Some(user) => {
                info!("Authentication successful for {}", user.username);
                self.authenticated_user = Some(user.username);
                reader
                    .write_all(b"235 Authentication successful\r\n")
                    .await?;
            }
            None => {
                warn!("Authentication failed for {}", username);
                reader.write_all(b"535 Authentication failed\r\n").await?;
                self.error_count += 1;
            }
        }

        Ok(())
    }

    async fn read_auth_line<S>(&self, reader: &mut BufReader<S>) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut line = String::new();
        timeout(COMMAND_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| MailError::SmtpProtocol("AUTH timeout".to_string()))??;
        Ok(line.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::connect_pool;

    async fn test_session(require_auth: bool) -> (tempfile::TempDir, SmtpSession) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.email_dir = dir.path().join("emails").to_string_lossy().to_string();
        let db_path = dir.path().join("mail.db");
        let pool = connect_pool(db_path.to_str().unwrap(), 2).await.unwrap();

        let mail_service = Arc::new(MailService::new(pool.clone(), &config).unwrap());
        let auth = Arc::new(AuthService::new(pool));

        let session = SmtpSession::new(
            "mail.test.local".to_string(),
            mail_service,
            auth,
            require_auth,
            10 * 1024 * 1024,
        );
        (dir, session)
    }

    #[tokio::test]
    async fn test_helo_then_envelope() {
        let (_dir, mut session) = test_session(false).await;

        let reply = session.handle_command(SmtpCommand::Helo("client".to_string()));
        assert!(reply.starts_with("250 "));
        assert_eq!(session.state(), SmtpState::Identified);

        let reply = session.handle_command(SmtpCommand::MailFrom("a@b.com".to_string()));
        assert!(reply.starts_with("250"));
        assert_eq!(session.state(), SmtpState::MailFrom);

        let reply = session.handle_command(SmtpCommand::RcptTo("c@d.com".to_string()));
        assert!(reply.starts_with("250"));

        let reply = session.handle_command(SmtpCommand::Data);
        assert!(reply.starts_with("354"));
        assert_eq!(session.state(), SmtpState::Data);
    }

    #[tokio::test]
    async fn test_ehlo_advertises_auth_and_size() {
        let (_dir, mut session) = test_session(false).await;
        let reply = session.handle_command(SmtpCommand::Ehlo("client".to_string()));
        assert!(reply.contains("250-AUTH PLAIN LOGIN"));
        assert!(reply.contains("250-SIZE"));
        assert!(reply.ends_with("250 HELP\r\n"));
    }

    #[tokio::test]
    async fn test_mail_from_requires_auth_when_configured() {
        let (_dir, mut session) = test_session(true).await;

        session.handle_command(SmtpCommand::Ehlo("client".to_string()));
        let reply = session.handle_command(SmtpCommand::MailFrom("a@b.com".to_string()));
        assert!(reply.starts_with("530 Authentication required"));
        // Not a sequencing error: state is unchanged
        assert_eq!(session.state(), SmtpState::Identified);
    }

    #[tokio::test]
    async fn test_out_of_sequence_commands() {
        let (_dir, mut session) = test_session(false).await;

        // MAIL before EHLO
        let reply = session.handle_command(SmtpCommand::MailFrom("a@b.com".to_string()));
        assert!(reply.starts_with("503"));

        session.handle_command(SmtpCommand::Ehlo("client".to_string()));

        let reply = session.handle_command(SmtpCommand::RcptTo("c@d.com".to_string()));
        assert!(reply.starts_with("503 Error: need MAIL"));

        let reply = session.handle_command(SmtpCommand::Data);
        assert!(reply.starts_with("503 Error: need MAIL"));

        session.handle_command(SmtpCommand::MailFrom("a@b.com".to_string()));
        let reply = session.handle_command(SmtpCommand::Data);
        assert!(reply.starts_with("503 Error: need RCPT"));
    }

    #[tokio::test]
    async fn test_rset_clears_envelope() {
        let (_dir, mut session) = test_session(false).await;

        session.handle_command(SmtpCommand::Ehlo("client".to_string()));
        session.handle_command(SmtpCommand::MailFrom("a@b.com".to_string()));
        session.handle_command(SmtpCommand::RcptTo("c@d.com".to_string()));

        let reply = session.handle_command(SmtpCommand::Rset);
        assert!(reply.starts_with("250"));
        assert_eq!(session.state(), SmtpState::Identified);
        assert!(session.mail_from.is_none());
        assert!(session.rcpt_tos.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_address_rejected() {
        let (_dir, mut session) = test_session(false).await;

        session.handle_command(SmtpCommand::Ehlo("client".to_string()));
        let reply = session.handle_command(SmtpCommand::MailFrom("not-an-address".to_string()));
        assert!(reply.starts_with("500"));
    }

    #[tokio::test]
    async fn test_unknown_command_is_500() {
        let (_dir, mut session) = test_session(false).await;
        let reply = session.handle_command(SmtpCommand::Unknown("VRFY".to_string()));
        assert!(reply.starts_with("500 Unrecognized command"));
    }

    #[tokio::test]
    async fn test_quit_from_any_state() {
        let (_dir, mut session) = test_session(false).await;
        let reply = session.handle_command(SmtpCommand::Quit);
        assert!(reply.starts_with("221"));
    }

    #[tokio::test]
    async fn test_process_envelope_saves_email() {
        let (_dir, mut session) = test_session(false).await;

        session.handle_command(SmtpCommand::Ehlo("client".to_string()));
        session.handle_command(SmtpCommand::MailFrom("alice@test.local".to_string()));
        session.handle_command(SmtpCommand::RcptTo("bob@test.local".to_string()));
        session.data = b"Subject: Hello\r\nFrom: alice@test.local\r\nTo: bob@test.local\r\n\r\nHi.\r\n".to_vec();

        let saved = session.process_envelope().await.unwrap();
        assert!(saved);

        let emails = session
            .mail_service
            .list_emails(&crate::storage::EmailQuery {
                user_email: Some("bob@test.local".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].subject, "Hello");
        // A Message-ID was synthesized and wrapped
        assert!(emails[0].message_id.starts_with('<'));
        assert!(emails[0].message_id.ends_with('>'));
    }

    #[tokio::test]
    async fn test_process_envelope_repairs_missing_from() {
        let (_dir, mut session) = test_session(false).await;

        session.handle_command(SmtpCommand::Ehlo("client".to_string()));
        session.handle_command(SmtpCommand::MailFrom("env@test.local".to_string()));
        session.handle_command(SmtpCommand::RcptTo("bob@test.local".to_string()));
        session.data = b"Subject: no from header\r\n\r\nbody\r\n".to_vec();

        assert!(session.process_envelope().await.unwrap());

        let emails = session
            .mail_service
            .list_emails(&crate::storage::EmailQuery::default())
            .await
            .unwrap();
        assert_eq!(emails[0].from_addr, "env@test.local");
    }
}
