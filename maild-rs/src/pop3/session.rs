//! Per-connection POP3 session.
//!
//! The three RFC 1939 states. On entry to TRANSACTION the session takes
//! a snapshot of the user's inbox; message numbers are 1-based positions
//! in that snapshot and stay stable for the whole session. DELE only
//! records Message-IDs in a marked set; the soft-deletes are applied in
//! UPDATE, which is reached exclusively through QUIT. Any other
//! teardown discards the marked set.

use crate::auth::AuthService;
use crate::pop3::commands::Pop3Command;
use crate::service::MailService;
use crate::storage::{EmailQuery, EmailRecord, EmailStatusUpdate};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Snapshot size cap for one session.
const SNAPSHOT_LIMIT: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop3State {
    Authorization,
    Transaction,
    Update,
}

/// A rendered reply: full wire text plus whether the connection should
/// close after sending it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pop3Reply {
    pub text: String,
    pub close: bool,
}

impl Pop3Reply {
    fn line(text: impl Into<String>) -> Self {
        let mut text = text.into();
        text.push_str("\r\n");
        Self { text, close: false }
    }

    fn closing(text: impl Into<String>) -> Self {
        let mut text = text.into();
        text.push_str("\r\n");
        Self { text, close: true }
    }

    fn multiline(text: String) -> Self {
        Self { text, close: false }
    }
}

pub struct Pop3Session {
    state: Pop3State,
    pending_user: Option<String>,
    username: Option<String>,
    user_email: Option<String>,
    snapshot: Vec<EmailRecord>,
    marked_for_deletion: HashSet<String>,
    mail_service: Arc<MailService>,
    auth: Arc<AuthService>,
}

impl Pop3Session {
    pub fn new(mail_service: Arc<MailService>, auth: Arc<AuthService>) -> Self {
        Self {
            state: Pop3State::Authorization,
            pending_user: None,
            username: None,
            user_email: None,
            snapshot: Vec::new(),
            marked_for_deletion: HashSet::new(),
            mail_service,
            auth,
        }
    }

    pub fn state(&self) -> Pop3State {
        self.state
    }

    pub fn greeting() -> String {
        "+OK POP3 server ready\r\n".to_string()
    }

    /// Process one command and render the reply.
    pub async fn handle_command(&mut self, cmd: Pop3Command) -> Pop3Reply {
        match cmd {
            Pop3Command::User(arg) => self.handle_user(arg),
            Pop3Command::Pass(arg) => self.handle_pass(arg).await,
            Pop3Command::Stat => self.handle_stat(),
            Pop3Command::List(arg) => self.handle_list(arg),
            Pop3Command::Uidl(arg) => self.handle_uidl(arg),
            Pop3Command::Retr(arg) => self.handle_retr(arg).await,
            Pop3Command::Top(arg) => self.handle_top(arg).await,
            Pop3Command::Dele(arg) => self.handle_dele(arg),
            Pop3Command::Noop => self.in_transaction(|_| Pop3Reply::line("+OK")),
            Pop3Command::Rset => self.handle_rset(),
            Pop3Command::Capa => Self::handle_capa(),
            Pop3Command::Quit => self.handle_quit().await,
            Pop3Command::Unknown(cmd) => {
                warn!("Unrecognized POP3 command: {}", cmd);
                Pop3Reply::line(format!("-ERR Unrecognized command: {}", cmd))
            }
        }
    }

    fn in_transaction(&mut self, f: impl FnOnce(&mut Self) -> Pop3Reply) -> Pop3Reply {
        if self.state != Pop3State::Transaction {
            return Pop3Reply::line("-ERR Command not valid in this state");
        }
        f(self)
    }

    fn handle_user(&mut self, username: String) -> Pop3Reply {
        if self.state != Pop3State::Authorization {
            return Pop3Reply::line("-ERR Command not valid in this state");
        }
        if username.is_empty() {
            return Pop3Reply::line("-ERR Username required");
        }

        self.pending_user = Some(username);
        Pop3Reply::line("+OK User name accepted, password please")
    }

    async fn handle_pass(&mut self, password: String) -> Pop3Reply {
        if self.state != Pop3State::Authorization {
            return Pop3Reply::line("-ERR Command not valid in this state");
        }
        let Some(login) = self.pending_user.clone() else {
            return Pop3Reply::line("-ERR USER first");
        };
        if password.is_empty() {
            return Pop3Reply::line("-ERR Password required");
        }

        let user = match self.auth.resolve_mailbox(&login, &password).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!("POP3 authentication failed for {}", login);
                self.pending_user = None;
                return Pop3Reply::line("-ERR Authentication failed");
            }
            Err(e) => {
                error!("POP3 authentication error for {}: {}", login, e);
                self.pending_user = None;
                return Pop3Reply::line("-ERR Authentication failed");
            }
        };

        match self.load_snapshot(&user.email).await {
            Ok(snapshot) => {
                info!(
                    "POP3 login for {} ({}), {} messages in snapshot",
                    user.username,
                    user.email,
                    snapshot.len()
                );
                self.state = Pop3State::Transaction;
                self.username = Some(user.username.clone());
                self.user_email = Some(user.email);
                self.snapshot = snapshot;
                Pop3Reply::line(format!(
                    "+OK {} logged in, {} messages waiting",
                    user.username,
                    self.snapshot.len()
                ))
            }
            Err(e) => {
                error!("Failed to load inbox for {}: {}", user.email, e);
                self.pending_user = None;
                self.username = None;
                self.user_email = None;
                self.state = Pop3State::Authorization;
                Pop3Reply::line("-ERR Database error, please try again later")
            }
        }
    }

    /// Inbox view for this session: non-deleted, non-recalled, non-spam
    /// messages addressed to (or sent by) the mailbox owner.
    async fn load_snapshot(&self, user_email: &str) -> crate::error::Result<Vec<EmailRecord>> {
        self.mail_service
            .list_emails(&EmailQuery {
                user_email: Some(user_email.to_string()),
                include_deleted: false,
                include_spam: false,
                include_recalled: false,
                is_spam: None,
                limit: SNAPSHOT_LIMIT,
                offset: 0,
            })
            .await
    }

    /// Resolve a 1-based message number into the snapshot.
    fn resolve_msg(&self, arg: &str) -> Result<usize, Pop3Reply> {
        if arg.is_empty() {
            return Err(Pop3Reply::line("-ERR Message number required"));
        }
        let msg_num: usize = arg
            .parse()
            .map_err(|_| Pop3Reply::line(format!("-ERR Invalid message number: {}", arg)))?;
        if msg_num >= 1 && msg_num <= self.snapshot.len() {
            Ok(msg_num)
        } else {
            Err(Pop3Reply::line(format!(
                "-ERR No such message, index {} out of range 1-{}",
                msg_num,
                self.snapshot.len()
            )))
        }
    }

    fn handle_stat(&mut self) -> Pop3Reply {
        self.in_transaction(|session| {
            let count = session.snapshot.len();
            let size: i64 = session.snapshot.iter().map(|e| e.size).sum();
            Pop3Reply::line(format!("+OK {} {}", count, size))
        })
    }

    fn handle_list(&mut self, arg: String) -> Pop3Reply {
        self.in_transaction(|session| {
            if arg.is_empty() {
                let mut out = format!("+OK {} messages\r\n", session.snapshot.len());
                for (i, email) in session.snapshot.iter().enumerate() {
                    out.push_str(&format!("{} {}\r\n", i + 1, email.size));
                }
                out.push_str(".\r\n");
                return Pop3Reply::multiline(out);
            }

            match session.resolve_msg(&arg) {
                Ok(msg_num) => {
                    let email = &session.snapshot[msg_num - 1];
                    Pop3Reply::line(format!("+OK {} {}", msg_num, email.size))
                }
                Err(reply) => reply,
            }
        })
    }

    fn handle_uidl(&mut self, arg: String) -> Pop3Reply {
        self.in_transaction(|session| {
            if arg.is_empty() {
                let mut out = String::from("+OK\r\n");
                for (i, email) in session.snapshot.iter().enumerate() {
                    out.push_str(&format!("{} {}\r\n", i + 1, uidl_of(email)));
                }
                out.push_str(".\r\n");
                return Pop3Reply::multiline(out);
            }

            match session.resolve_msg(&arg) {
                Ok(msg_num) => {
                    let email = &session.snapshot[msg_num - 1];
                    Pop3Reply::line(format!("+OK {} {}", msg_num, uidl_of(email)))
                }
                Err(reply) => reply,
            }
        })
    }

    async fn handle_retr(&mut self, arg: String) -> Pop3Reply {
        if self.state != Pop3State::Transaction {
            return Pop3Reply::line("-ERR Command not valid in this state");
        }

        let msg_num = match self.resolve_msg(&arg) {
            Ok(n) => n,
            Err(reply) => return reply,
        };
        let message_id = self.snapshot[msg_num - 1].message_id.clone();

        let content = match self.mail_service.get_email_content(&message_id).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                warn!("Content not found for {}", message_id);
                return Pop3Reply::line("-ERR Message content not found");
            }
            Err(e) => {
                error!("Failed to retrieve {}: {}", message_id, e);
                return Pop3Reply::line("-ERR Failed to retrieve message content");
            }
        };

        // Mark read; a failure here does not fail the RETR
        if let Err(e) = self.mail_service.mark_read(&message_id).await {
            warn!("Failed to mark {} as read: {}", message_id, e);
        }

        let normalized = normalize_crlf(&content);
        let octets = normalized.len();
        let stuffed = dot_stuff(&normalized);

        debug!("RETR {} -> {} octets", message_id, octets);
        Pop3Reply::multiline(format!("+OK {} octets\r\n{}.\r\n", octets, stuffed))
    }

    async fn handle_top(&mut self, arg: String) -> Pop3Reply {
        if self.state != Pop3State::Transaction {
            return Pop3Reply::line("-ERR Command not valid in this state");
        }

        let parts: Vec<&str> = arg.split_whitespace().collect();
        if parts.len() != 2 {
            return Pop3Reply::line("-ERR Usage: TOP msg_num n");
        }
        let (Ok(msg_num), Ok(n_lines)) = (parts[0].parse::<usize>(), parts[1].parse::<usize>())
        else {
            return Pop3Reply::line("-ERR Invalid parameters");
        };
        if msg_num < 1 || msg_num > self.snapshot.len() {
            return Pop3Reply::line("-ERR No such message");
        }
        let message_id = self.snapshot[msg_num - 1].message_id.clone();

        let content = match self.mail_service.get_email_content(&message_id).await {
            Ok(Some(content)) => content,
            Ok(None) => return Pop3Reply::line("-ERR Message content not found"),
            Err(e) => {
                error!("Failed to retrieve {}: {}", message_id, e);
                return Pop3Reply::line("-ERR Failed to retrieve message content");
            }
        };

        let normalized = normalize_crlf(&content);
        let (header, body) = match normalized.split_once("\r\n\r\n") {
            Some((h, b)) => (h.to_string(), b.to_string()),
            None => (normalized.trim_end().to_string(), String::new()),
        };

        let mut out = String::from("+OK\r\n");
        for line in header.lines() {
            out.push_str(&stuff_line(line));
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        for line in body.lines().take(n_lines) {
            out.push_str(&stuff_line(line));
            out.push_str("\r\n");
        }
        out.push_str(".\r\n");

        Pop3Reply::multiline(out)
    }

    fn handle_dele(&mut self, arg: String) -> Pop3Reply {
        self.in_transaction(|session| {
            match session.resolve_msg(&arg) {
                Ok(msg_num) => {
                    let message_id = session.snapshot[msg_num - 1].message_id.clone();

                    // The marked set is idempotent
                    if session.marked_for_deletion.contains(&message_id) {
                        return Pop3Reply::line(format!("+OK Message {} already deleted", msg_num));
                    }

                    info!("Marked for deletion: {}", message_id);
                    session.marked_for_deletion.insert(message_id);
                    Pop3Reply::line(format!("+OK Message {} deleted", msg_num))
                }
                Err(reply) => reply,
            }
        })
    }

    fn handle_rset(&mut self) -> Pop3Reply {
        self.in_transaction(|session| {
            session.marked_for_deletion.clear();
            Pop3Reply::line("+OK")
        })
    }

    fn handle_capa() -> Pop3Reply {
        Pop3Reply::multiline(
            "+OK Capability list follows\r\nUSER\r\nTOP\r\nUIDL\r\nRESP-CODES\r\nPIPELINING\r\nAUTH-RESP-CODE\r\n.\r\n"
                .to_string(),
        )
    }

    /// QUIT from TRANSACTION enters UPDATE and applies the deferred
    /// deletes. Per-message failures are logged and do not abort the
    /// phase.
    async fn handle_quit(&mut self) -> Pop3Reply {
        if self.state == Pop3State::Transaction {
            self.state = Pop3State::Update;
            self.perform_deletions().await;
        }
        Pop3Reply::closing("+OK POP3 server signing off")
    }

    async fn perform_deletions(&mut self) {
        let marked = std::mem::take(&mut self.marked_for_deletion);
        let total = marked.len();

        for message_id in marked {
            let update = EmailStatusUpdate {
                is_deleted: Some(true),
                ..Default::default()
            };
            match self.mail_service.update_email(&message_id, update).await {
                Ok(true) => debug!("Soft-deleted {}", message_id),
                Ok(false) => warn!("Soft delete had no effect for {}", message_id),
                Err(e) => error!("Failed to soft-delete {}: {}", message_id, e),
            }
        }

        if total > 0 {
            info!("UPDATE phase applied {} deletions", total);
        }
    }
}

/// UIDs are the canonical Message-ID with the angle brackets stripped.
fn uidl_of(email: &EmailRecord) -> String {
    email
        .message_id
        .trim_matches(|c| c == '<' || c == '>')
        .to_string()
}

/// Normalize all line endings to CRLF and guarantee a trailing CRLF.
pub fn normalize_crlf(content: &str) -> String {
    let mut normalized = content
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\n', "\r\n");
    if !normalized.ends_with("\r\n") {
        normalized.push_str("\r\n");
    }
    normalized
}

fn stuff_line(line: &str) -> String {
    if line.starts_with('.') {
        format!(".{}", line)
    } else {
        line.to_string()
    }
}

/// Apply dot-stuffing to CRLF-normalized content.
pub fn dot_stuff(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.split("\r\n") {
        out.push_str(&stuff_line(line));
        out.push_str("\r\n");
    }
    // split produces a trailing empty segment for the final CRLF
    if content.ends_with("\r\n") {
        out.truncate(out.len() - 2);
    }
    out
}
