//! POP3 session tests: the three-state machine, snapshot numbering,
//! and deferred deletion semantics.

use maild_rs::auth::AuthService;
use maild_rs::config::Config;
use maild_rs::pop3::session::normalize_crlf;
use maild_rs::pop3::{Pop3Command, Pop3Session, Pop3State};
use maild_rs::service::{IncomingEmail, MailService};
use maild_rs::storage::{connect_pool, EmailQuery};
use std::sync::Arc;

struct Fixture {
    _dir: tempfile::TempDir,
    service: Arc<MailService>,
    auth: Arc<AuthService>,
}

impl Fixture {
    fn session(&self) -> Pop3Session {
        Pop3Session::new(self.service.clone(), self.auth.clone())
    }
}

/// One user (alice/alicepass) with three messages, newest first:
/// #1 "third", #2 "second", #3 "first".
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

    for (i, (subject, hour)) in [("first", 8), ("second", 9), ("third", 10)].iter().enumerate() {
        let message_id = format!("<m{}@test>", i + 1);
        let date = format!("2025-07-01T{:02}:00:00", hour);
        let eml = format!(
            "From: sender@test.local\r\nTo: alice@test.local\r\nSubject: {}\r\nMessage-ID: {}\r\n\r\nbody of {}\r\n",
            subject, message_id, subject
        );
        service
            .save_email(
                IncomingEmail {
                    message_id,
                    from_addr: "sender@test.local".to_string(),
                    to_addrs: vec!["alice@test.local".to_string()],
                    subject: subject.to_string(),
                    date,
                },
                &format!("body of {}", subject),
                &eml,
            )
            .await
            .unwrap();
    }

    Fixture {
        _dir: dir,
        service,
        auth,
    }
}

async fn login(session: &mut Pop3Session) {
    let reply = session
        .handle_command(Pop3Command::User("alice".to_string()))
        .await;
    assert!(reply.text.starts_with("+OK"));
    let reply = session
        .handle_command(Pop3Command::Pass("alicepass".to_string()))
        .await;
    assert!(reply.text.starts_with("+OK"), "login failed: {}", reply.text);
    assert_eq!(session.state(), Pop3State::Transaction);
}

#[tokio::test]
async fn test_login_reports_message_count() {
    let fixture = setup().await;
    let mut session = fixture.session();

    login(&mut session).await;
    // The PASS reply already carried the count; STAT confirms it
    let reply = session.handle_command(Pop3Command::Stat).await;
    assert!(reply.text.starts_with("+OK 3 "));
}

#[tokio::test]
async fn test_wrong_password_stays_in_authorization() {
    let fixture = setup().await;
    let mut session = fixture.session();

    session
        .handle_command(Pop3Command::User("alice".to_string()))
        .await;
    let reply = session
        .handle_command(Pop3Command::Pass("wrong".to_string()))
        .await;
    assert_eq!(reply.text, "-ERR Authentication failed\r\n");
    assert_eq!(session.state(), Pop3State::Authorization);

    // A new USER/PASS attempt still works
    session
        .handle_command(Pop3Command::User("alice".to_string()))
        .await;
    let reply = session
        .handle_command(Pop3Command::Pass("alicepass".to_string()))
        .await;
    assert!(reply.text.starts_with("+OK"));
}

#[tokio::test]
async fn test_pass_requires_user_first() {
    let fixture = setup().await;
    let mut session = fixture.session();

    let reply = session
        .handle_command(Pop3Command::Pass("alicepass".to_string()))
        .await;
    assert_eq!(reply.text, "-ERR USER first\r\n");
}

#[tokio::test]
async fn test_transaction_commands_rejected_before_login() {
    let fixture = setup().await;
    let mut session = fixture.session();

    for cmd in [
        Pop3Command::Stat,
        Pop3Command::List("".to_string()),
        Pop3Command::Retr("1".to_string()),
        Pop3Command::Dele("1".to_string()),
        Pop3Command::Noop,
        Pop3Command::Rset,
    ] {
        let reply = session.handle_command(cmd).await;
        assert_eq!(reply.text, "-ERR Command not valid in this state\r\n");
    }
}

#[tokio::test]
async fn test_list_numbering_is_newest_first() {
    let fixture = setup().await;
    let mut session = fixture.session();
    login(&mut session).await;

    let reply = session.handle_command(Pop3Command::List("".to_string())).await;
    assert!(reply.text.starts_with("+OK 3 messages\r\n"));
    assert!(reply.text.ends_with(".\r\n"));
    let lines: Vec<&str> = reply.text.lines().collect();
    assert!(lines[1].starts_with("1 "));
    assert!(lines[2].starts_with("2 "));
    assert!(lines[3].starts_with("3 "));

    // Single-message form
    let reply = session.handle_command(Pop3Command::List("2".to_string())).await;
    assert!(reply.text.starts_with("+OK 2 "));

    // Out of range names the valid range
    let reply = session.handle_command(Pop3Command::List("4".to_string())).await;
    assert!(reply.text.contains("out of range 1-3"));
}

#[tokio::test]
async fn test_uidl_has_no_angle_brackets() {
    let fixture = setup().await;
    let mut session = fixture.session();
    login(&mut session).await;

    let reply = session.handle_command(Pop3Command::Uidl("".to_string())).await;
    assert!(reply.text.starts_with("+OK\r\n"));
    assert!(!reply.text.contains('<'));
    assert!(!reply.text.contains('>'));
    // Newest message is #1
    assert!(reply.text.contains("1 m3_at_test") || reply.text.contains("1 m3@test"));

    let reply = session.handle_command(Pop3Command::Uidl("1".to_string())).await;
    assert_eq!(reply.text, "+OK 1 m3@test\r\n");
}

#[tokio::test]
async fn test_retr_serialization_and_read_flag() {
    let fixture = setup().await;
    let mut session = fixture.session();
    login(&mut session).await;

    let reply = session.handle_command(Pop3Command::Retr("1".to_string())).await;
    assert!(reply.text.ends_with(".\r\n"));
    assert!(reply.text.contains("Subject: third"));
    assert!(reply.text.contains("body of third"));

    // The +OK line carries the post-normalization octet count
    let record = fixture
        .service
        .get_email("<m3@test>", false)
        .await
        .unwrap()
        .unwrap()
        .record;
    let stored = std::fs::read_to_string(record.content_path.as_ref().unwrap()).unwrap();
    let expected_octets = normalize_crlf(&stored).len();
    assert!(
        reply.text.starts_with(&format!("+OK {} octets\r\n", expected_octets)),
        "unexpected size prefix: {}",
        reply.text.lines().next().unwrap_or("")
    );

    // RETR marked the message read
    assert!(record.is_read);
}

#[tokio::test]
async fn test_retr_missing_content_synthesizes_envelope() {
    let fixture = setup().await;
    let mut session = fixture.session();
    login(&mut session).await;

    let record = fixture
        .service
        .get_email("<m3@test>", false)
        .await
        .unwrap()
        .unwrap()
        .record;
    std::fs::remove_file(record.content_path.unwrap()).unwrap();

    let reply = session.handle_command(Pop3Command::Retr("1".to_string())).await;
    assert!(reply.text.starts_with("+OK "));
    assert!(reply.text.contains("octets"));
    assert!(reply.text.contains("Message-ID: <m3@test>"));
    assert!(reply.text.ends_with(".\r\n"));
}

#[tokio::test]
async fn test_retr_bad_arguments() {
    let fixture = setup().await;
    let mut session = fixture.session();
    login(&mut session).await;

    let reply = session.handle_command(Pop3Command::Retr("abc".to_string())).await;
    assert_eq!(reply.text, "-ERR Invalid message number: abc\r\n");

    let reply = session.handle_command(Pop3Command::Retr("".to_string())).await;
    assert_eq!(reply.text, "-ERR Message number required\r\n");

    let reply = session.handle_command(Pop3Command::Retr("0".to_string())).await;
    assert!(reply.text.starts_with("-ERR No such message"));
}

#[tokio::test]
async fn test_top_returns_headers_and_limited_body() {
    let fixture = setup().await;
    let mut session = fixture.session();
    login(&mut session).await;

    let reply = session.handle_command(Pop3Command::Top("1 0".to_string())).await;
    assert!(reply.text.starts_with("+OK\r\n"));
    assert!(reply.text.contains("Subject: third"));
    // Zero body lines requested
    assert!(!reply.text.contains("body of third"));
    assert!(reply.text.ends_with(".\r\n"));

    let reply = session.handle_command(Pop3Command::Top("1 10".to_string())).await;
    assert!(reply.text.contains("body of third"));

    let reply = session.handle_command(Pop3Command::Top("1".to_string())).await;
    assert_eq!(reply.text, "-ERR Usage: TOP msg_num n\r\n");

    let reply = session.handle_command(Pop3Command::Top("9 1".to_string())).await;
    assert_eq!(reply.text, "-ERR No such message\r\n");
}

#[tokio::test]
async fn test_dele_is_idempotent_within_session() {
    let fixture = setup().await;
    let mut session = fixture.session();
    login(&mut session).await;

    let reply = session.handle_command(Pop3Command::Dele("2".to_string())).await;
    assert_eq!(reply.text, "+OK Message 2 deleted\r\n");

    let reply = session.handle_command(Pop3Command::Dele("2".to_string())).await;
    assert_eq!(reply.text, "+OK Message 2 already deleted\r\n");

    // Numbering is unchanged after DELE
    let reply = session.handle_command(Pop3Command::List("".to_string())).await;
    assert!(reply.text.starts_with("+OK 3 messages"));
}

#[tokio::test]
async fn test_rset_discards_marks() {
    let fixture = setup().await;
    let mut session = fixture.session();
    login(&mut session).await;

    session.handle_command(Pop3Command::Dele("1".to_string())).await;
    let reply = session.handle_command(Pop3Command::Rset).await;
    assert_eq!(reply.text, "+OK\r\n");

    let reply = session.handle_command(Pop3Command::Quit).await;
    assert!(reply.close);

    // Nothing was deleted
    let fresh = fixture
        .service
        .list_emails(&EmailQuery {
            user_email: Some("alice@test.local".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(fresh.len(), 3);
}

#[tokio::test]
async fn test_quit_applies_marked_deletions() {
    let fixture = setup().await;
    let mut session = fixture.session();
    login(&mut session).await;

    session.handle_command(Pop3Command::Dele("1".to_string())).await;
    session.handle_command(Pop3Command::Dele("3".to_string())).await;

    let reply = session.handle_command(Pop3Command::Quit).await;
    assert_eq!(reply.text, "+OK POP3 server signing off\r\n");
    assert!(reply.close);
    assert_eq!(session.state(), Pop3State::Update);

    // #1 = <m3@test>, #3 = <m1@test>; only <m2@test> survives
    let fresh = fixture
        .service
        .list_emails(&EmailQuery {
            user_email: Some("alice@test.local".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].message_id, "<m2@test>");

    // Soft delete only: the tombstoned rows remain queryable
    let with_deleted = fixture
        .service
        .list_emails(&EmailQuery {
            user_email: Some("alice@test.local".to_string()),
            include_deleted: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(with_deleted.len(), 3);
}

#[tokio::test]
async fn test_dropped_session_deletes_nothing() {
    let fixture = setup().await;

    {
        let mut session = fixture.session();
        login(&mut session).await;
        session.handle_command(Pop3Command::Dele("1".to_string())).await;
        session.handle_command(Pop3Command::Dele("3".to_string())).await;
        // Connection drops without QUIT: the session is simply dropped
    }

    let mut fresh = fixture.session();
    login(&mut fresh).await;
    let reply = fresh.handle_command(Pop3Command::Stat).await;
    assert!(reply.text.starts_with("+OK 3 "));
}

#[tokio::test]
async fn test_quit_from_authorization_skips_update() {
    let fixture = setup().await;
    let mut session = fixture.session();

    let reply = session.handle_command(Pop3Command::Quit).await;
    assert_eq!(reply.text, "+OK POP3 server signing off\r\n");
    assert!(reply.close);
    assert_eq!(session.state(), Pop3State::Authorization);
}

#[tokio::test]
async fn test_capa_lists_capabilities() {
    let fixture = setup().await;
    let mut session = fixture.session();

    let reply = session.handle_command(Pop3Command::Capa).await;
    assert!(reply.text.starts_with("+OK Capability list follows\r\n"));
    for capability in ["USER", "TOP", "UIDL", "RESP-CODES", "PIPELINING", "AUTH-RESP-CODE"] {
        assert!(reply.text.contains(capability));
    }
    assert!(reply.text.ends_with(".\r\n"));
}

#[tokio::test]
async fn test_unknown_command() {
    let fixture = setup().await;
    let mut session = fixture.session();

    let reply = session
        .handle_command(Pop3Command::Unknown("APOP".to_string()))
        .await;
    assert_eq!(reply.text, "-ERR Unrecognized command: APOP\r\n");
}

#[tokio::test]
async fn test_spam_is_invisible_to_pop3() {
    let fixture = setup().await;

    fixture
        .service
        .save_email(
            IncomingEmail {
                message_id: "<spam@test>".to_string(),
                from_addr: "spammer@elsewhere.net".to_string(),
                to_addrs: vec!["alice@test.local".to_string()],
                subject: "winner lottery prize".to_string(),
                date: "2025-07-01T12:00:00".to_string(),
            },
            "free viagra",
            "From: spammer@elsewhere.net\r\nTo: alice@test.local\r\nSubject: winner lottery prize\r\nMessage-ID: <spam@test>\r\n\r\nfree viagra\r\n",
        )
        .await
        .unwrap();

    let mut session = fixture.session();
    login(&mut session).await;
    let reply = session.handle_command(Pop3Command::Stat).await;
    // The spam message is not part of the snapshot
    assert!(reply.text.starts_with("+OK 3 "));
}
