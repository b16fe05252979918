//! Wire-level protocol tests: full SMTP and POP3 exchanges over
//! in-memory streams, covering authentication gating, ingress, and
//! retrieval of the stored message.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use maild_rs::auth::AuthService;
use maild_rs::config::Config;
use maild_rs::pop3::{handle_connection, Pop3Session};
use maild_rs::service::MailService;
use maild_rs::smtp::SmtpSession;
use maild_rs::storage::connect_pool;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

struct Fixture {
    _dir: tempfile::TempDir,
    service: Arc<MailService>,
    auth: Arc<AuthService>,
    config: Config,
}

async fn setup() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.email_dir = dir.path().join("emails").to_string_lossy().to_string();

    let db_path = dir.path().join("mail.db");
    let pool = connect_pool(db_path.to_str().unwrap(), 3).await.unwrap();

    let service = Arc::new(MailService::new(pool.clone(), &config).unwrap());
    let auth = Arc::new(AuthService::new(pool));

    auth.create_user("alice", "alice@test.local", "alicepass", None)
        .await
        .unwrap();

    Fixture {
        _dir: dir,
        service,
        auth,
        config,
    }
}

struct Client {
    reader: BufReader<DuplexStream>,
}

impl Client {
    fn new(stream: DuplexStream) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    async fn send(&mut self, line: &str) {
        self.reader
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line
    }

    /// Read one SMTP reply, consuming `250-`-style continuation lines.
    async fn read_smtp_reply(&mut self) -> String {
        let mut last = String::new();
        loop {
            let line = self.read_line().await;
            let done = line.len() < 4 || line.as_bytes().get(3) != Some(&b'-');
            last = line;
            if done {
                return last;
            }
        }
    }

    /// Read a POP3 multi-line payload up to the terminating `.` line.
    async fn read_multiline(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            if line == ".\r\n" {
                return lines;
            }
            lines.push(line);
        }
    }
}

fn spawn_smtp(fixture: &Fixture, require_auth: bool) -> Client {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);

    let session = SmtpSession::new(
        "mail.test.local".to_string(),
        fixture.service.clone(),
        fixture.auth.clone(),
        require_auth,
        fixture.config.smtp.max_message_size,
    );
    tokio::spawn(async move {
        let _ = session.handle(server_side).await;
    });

    Client::new(client_side)
}

fn spawn_pop3(fixture: &Fixture) -> Client {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);

    let session = Pop3Session::new(fixture.service.clone(), fixture.auth.clone());
    tokio::spawn(async move {
        let _ = handle_connection(server_side, session, Duration::from_secs(300)).await;
    });

    Client::new(client_side)
}

fn plain_credentials(user: &str, password: &str) -> String {
    BASE64.encode(format!("\0{}\0{}", user, password))
}

#[tokio::test]
async fn test_auth_gating_then_submission() {
    let fixture = setup().await;
    let mut client = spawn_smtp(&fixture, true);

    assert!(client.read_line().await.starts_with("220 "));

    client.send("EHLO client.test").await;
    let reply = client.read_smtp_reply().await;
    assert!(reply.starts_with("250 "));

    // MAIL FROM before AUTH is a 530, not a 503
    client.send("MAIL FROM:<alice@test.local>").await;
    assert!(client
        .read_line()
        .await
        .starts_with("530 Authentication required"));

    client
        .send(&format!(
            "AUTH PLAIN {}",
            plain_credentials("alice", "alicepass")
        ))
        .await;
    assert!(client.read_line().await.starts_with("235 "));

    client.send("MAIL FROM:<alice@test.local>").await;
    assert!(client.read_line().await.starts_with("250"));

    client.send("RCPT TO:<alice@test.local>").await;
    assert!(client.read_line().await.starts_with("250"));

    client.send("DATA").await;
    assert!(client.read_line().await.starts_with("354"));

    client.send("Subject: Hello").await;
    client.send("").await;
    client.send("Hi.").await;
    client.send(".").await;
    assert!(client
        .read_line()
        .await
        .starts_with("250 Message accepted for delivery"));

    client.send("QUIT").await;
    assert!(client.read_line().await.starts_with("221"));
}

#[tokio::test]
async fn test_auth_plain_blank_credentials_fail() {
    let fixture = setup().await;
    let mut client = spawn_smtp(&fixture, true);

    client.read_line().await;
    client.send("EHLO client.test").await;
    client.read_smtp_reply().await;

    client
        .send(&format!(
            "AUTH PLAIN {}",
            plain_credentials("", "alicepass")
        ))
        .await;
    assert!(client.read_line().await.starts_with("535"));

    client
        .send(&format!("AUTH PLAIN {}", plain_credentials("alice", "")))
        .await;
    assert!(client.read_line().await.starts_with("535"));
}

#[tokio::test]
async fn test_auth_login_two_step() {
    let fixture = setup().await;
    let mut client = spawn_smtp(&fixture, true);

    client.read_line().await;
    client.send("EHLO client.test").await;
    client.read_smtp_reply().await;

    client.send("AUTH LOGIN").await;
    assert!(client.read_line().await.starts_with("334 VXNlcm5hbWU6"));
    client.send(&BASE64.encode("alice")).await;
    assert!(client.read_line().await.starts_with("334 UGFzc3dvcmQ6"));
    client.send(&BASE64.encode("alicepass")).await;
    assert!(client.read_line().await.starts_with("235 "));
}

#[tokio::test]
async fn test_dot_stuffed_body_is_unstuffed() {
    let fixture = setup().await;
    let mut client = spawn_smtp(&fixture, false);

    client.read_line().await;
    client.send("HELO client.test").await;
    client.read_line().await;
    client.send("MAIL FROM:<alice@test.local>").await;
    client.read_line().await;
    client.send("RCPT TO:<alice@test.local>").await;
    client.read_line().await;
    client.send("DATA").await;
    client.read_line().await;

    client.send("Subject: stuffing").await;
    client.send("").await;
    client.send("..leading dot").await;
    client.send(".").await;
    assert!(client.read_line().await.starts_with("250"));

    let emails = fixture
        .service
        .list_emails(&maild_rs::storage::EmailQuery::default())
        .await
        .unwrap();
    assert_eq!(emails.len(), 1);
    let content = fixture
        .service
        .get_email_content(&emails[0].message_id)
        .await
        .unwrap()
        .unwrap();
    // Stored with the stuffing reversed
    assert!(content.contains("\r\n.leading dot"));
    assert!(!content.contains("..leading dot"));
}

#[tokio::test]
async fn test_session_accepts_multiple_envelopes() {
    let fixture = setup().await;
    let mut client = spawn_smtp(&fixture, false);

    client.read_line().await;
    client.send("EHLO client.test").await;
    client.read_smtp_reply().await;

    for subject in ["one", "two"] {
        client.send("MAIL FROM:<alice@test.local>").await;
        assert!(client.read_line().await.starts_with("250"));
        client.send("RCPT TO:<alice@test.local>").await;
        assert!(client.read_line().await.starts_with("250"));
        client.send("DATA").await;
        assert!(client.read_line().await.starts_with("354"));
        client.send(&format!("Subject: {}", subject)).await;
        client.send("").await;
        client.send("body").await;
        client.send(".").await;
        assert!(client.read_line().await.starts_with("250"));
    }

    let emails = fixture
        .service
        .list_emails(&maild_rs::storage::EmailQuery::default())
        .await
        .unwrap();
    assert_eq!(emails.len(), 2);
}

#[tokio::test]
async fn test_smtp_ingress_then_pop3_retrieval() {
    let fixture = setup().await;

    // Submit a message over SMTP
    let mut smtp = spawn_smtp(&fixture, true);
    smtp.read_line().await;
    smtp.send("EHLO client.test").await;
    smtp.read_smtp_reply().await;
    smtp.send(&format!(
        "AUTH PLAIN {}",
        plain_credentials("alice", "alicepass")
    ))
    .await;
    assert!(smtp.read_line().await.starts_with("235"));
    smtp.send("MAIL FROM:<alice@test.local>").await;
    smtp.read_line().await;
    smtp.send("RCPT TO:<alice@test.local>").await;
    smtp.read_line().await;
    smtp.send("DATA").await;
    smtp.read_line().await;
    smtp.send("Subject: Hello").await;
    smtp.send("").await;
    smtp.send("Hi.").await;
    smtp.send(".").await;
    assert!(smtp.read_line().await.starts_with("250"));

    // Retrieve it over POP3
    let mut pop3 = spawn_pop3(&fixture);
    assert!(pop3.read_line().await.starts_with("+OK POP3 server ready"));

    pop3.send("USER alice").await;
    assert!(pop3.read_line().await.starts_with("+OK"));
    pop3.send("PASS alicepass").await;
    let reply = pop3.read_line().await;
    assert!(reply.starts_with("+OK"), "login failed: {}", reply);

    pop3.send("STAT").await;
    let stat = pop3.read_line().await;
    assert!(stat.starts_with("+OK 1 "), "unexpected STAT: {}", stat);

    pop3.send("LIST").await;
    let first = pop3.read_line().await;
    assert!(first.starts_with("+OK 1 message"));
    let listing = pop3.read_multiline().await;
    assert_eq!(listing.len(), 1);
    assert!(listing[0].starts_with("1 "));

    pop3.send("RETR 1").await;
    let ok = pop3.read_line().await;
    assert!(ok.starts_with("+OK "), "unexpected RETR status: {}", ok);
    assert!(ok.contains("octets"));
    let body = pop3.read_multiline().await;
    let text: String = body.concat();
    assert!(text.contains("Subject: Hello"));
    assert!(text.contains("Hi."));

    pop3.send("QUIT").await;
    assert!(pop3.read_line().await.starts_with("+OK"));
}

#[tokio::test]
async fn test_pop3_too_fresh_commands_and_capa() {
    let fixture = setup().await;
    let mut pop3 = spawn_pop3(&fixture);

    pop3.read_line().await;

    pop3.send("STAT").await;
    assert!(pop3
        .read_line()
        .await
        .starts_with("-ERR Command not valid in this state"));

    pop3.send("CAPA").await;
    let first = pop3.read_line().await;
    assert!(first.starts_with("+OK Capability list follows"));
    let capabilities = pop3.read_multiline().await;
    assert!(capabilities.iter().any(|l| l.starts_with("UIDL")));

    pop3.send("QUIT").await;
    assert!(pop3.read_line().await.starts_with("+OK"));
}
