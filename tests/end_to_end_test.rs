//! End-to-end tests over real loopback sockets: the SMTP client engine
//! submits through the SMTP server, storage commits, and the POP3 client
//! engine retrieves through the POP3 server.

use postbox::config::Config;
use postbox::message::{Address, Message, MessageBuilder};
use postbox::pop3::{MessageFilter, Pop3Fetcher, Pop3FetcherConfig, Pop3Server};
use postbox::security::Authenticator;
use postbox::smtp::{SmtpSender, SmtpSenderConfig, SmtpServer};
use postbox::storage::{ContentStore, MailStore};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

struct Harness {
    smtp_addr: SocketAddr,
    pop3_addr: SocketAddr,
    store: MailStore,
    content: ContentStore,
    _dir: TempDir,
}

/// Start both servers on ephemeral loopback ports over a shared store.
async fn harness(mutate: impl FnOnce(&mut Config)) -> Harness {
    let dir = TempDir::new().unwrap();
    let db_url = format!("sqlite:{}", dir.path().join("mail.db").display());

    let mut config = Config::default();
    config.smtp.listen_addr = "127.0.0.1:0".to_string();
    config.pop3.listen_addr = "127.0.0.1:0".to_string();
    config.storage.emails_dir = dir.path().join("emails").display().to_string();
    mutate(&mut config);

    let store = MailStore::open(&db_url).await.unwrap();
    let content = ContentStore::new(config.storage.emails_dir.clone());
    content.init().await.unwrap();

    let authenticator = Authenticator::new(store.clone()).unwrap();
    authenticator
        .add_user("bob", "bob@example.test", "hunter2")
        .await
        .unwrap();

    let smtp = SmtpServer::new(
        &config,
        store.clone(),
        content.clone(),
        Some(authenticator.clone()),
    )
    .unwrap()
    .bind()
    .await
    .unwrap();
    let pop3 = Pop3Server::new(&config, store.clone(), content.clone(), authenticator)
        .unwrap()
        .bind()
        .await
        .unwrap();

    let smtp_addr = smtp.local_addr().unwrap();
    let pop3_addr = pop3.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = smtp.run().await;
    });
    tokio::spawn(async move {
        let _ = pop3.run().await;
    });

    Harness {
        smtp_addr,
        pop3_addr,
        store,
        content,
        _dir: dir,
    }
}

fn sender_config(h: &Harness) -> SmtpSenderConfig {
    let mut config = SmtpSenderConfig::new("127.0.0.1", h.smtp_addr.port());
    config.max_retries = 0;
    config.ehlo_domain = Some("client.test".to_string());
    config
}

fn fetcher_config(h: &Harness) -> Pop3FetcherConfig {
    let mut config = Pop3FetcherConfig::new("127.0.0.1", h.pop3_addr.port(), "bob", "hunter2");
    config.max_retries = 0;
    config
}

fn sample_message(subject: &str) -> Message {
    Message::new(
        Address::parse("Alice <alice@remote.test>").unwrap(),
        vec![Address::parse("bob@example.test").unwrap()],
        subject,
    )
    .with_text("hello bob\nthis line has a\n.leading dot\n")
}

#[tokio::test]
async fn test_submit_then_fetch_byte_identical() -> anyhow::Result<()> {
    let h = harness(|_| {}).await;

    let message = sample_message("round trip");
    let wire = MessageBuilder::build(&message)?;

    SmtpSender::new(sender_config(&h)).send(&message).await?;

    let record = h
        .store
        .get_inbox(&message.message_id)
        .await?
        .expect("inbox row missing");
    assert_eq!(record.from_addr, "alice@remote.test");
    assert_eq!(record.to_addrs, vec!["bob@example.test"]);
    assert_eq!(record.subject, "round trip");
    assert_eq!(record.size as usize, wire.len());

    let mut fetcher = Pop3Fetcher::new(fetcher_config(&h));
    fetcher.connect().await?;

    let (count, size) = fetcher.status().await?;
    assert_eq!(count, 1);
    assert_eq!(size as usize, wire.len());

    // The retrieved payload is byte-identical to what the sender framed
    let fetched = fetcher.retrieve_raw(1).await?;
    assert_eq!(fetched, wire);

    let parsed = fetcher.retrieve(1, false).await?;
    assert_eq!(parsed.subject, "round trip");
    assert_eq!(parsed.message_id, message.message_id);
    assert!(parsed.text_body.unwrap().contains(".leading dot"));

    fetcher.quit().await?;
    Ok(())
}

#[tokio::test]
async fn test_sent_copy_recorded() -> anyhow::Result<()> {
    let h = harness(|_| {}).await;

    let message = sample_message("with copy");
    SmtpSender::new(sender_config(&h))
        .with_sent_copy(h.store.clone(), h.content.clone())
        .send(&message)
        .await?;

    let record = h
        .store
        .get_sent(&message.message_id)
        .await?
        .expect("sent row missing");
    assert_eq!(record.subject, "with copy");
    assert!(record.is_read);

    let stored = h.content.get(&message.message_id, None).await?;
    assert_eq!(stored, MessageBuilder::build(&message)?);
    Ok(())
}

#[tokio::test]
async fn test_retrieve_delete_cycle_across_sessions() {
    let h = harness(|_| {}).await;
    let sender = SmtpSender::new(sender_config(&h));

    let first = sample_message("first");
    sender.send(&first).await.unwrap();
    // Distinct timestamps keep snapshot order deterministic
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let second = sample_message("second");
    sender.send(&second).await.unwrap();

    // Session A: delete message 1, then QUIT commits
    let mut session_a = Pop3Fetcher::new(fetcher_config(&h));
    session_a.connect().await.unwrap();
    let (count, _) = session_a.status().await.unwrap();
    assert_eq!(count, 2);
    let fetched = session_a.retrieve(1, true).await.unwrap();
    assert_eq!(fetched.subject, "first");
    session_a.quit().await.unwrap();

    // Session B: only the second message remains, renumbered from 1
    let mut session_b = Pop3Fetcher::new(fetcher_config(&h));
    session_b.connect().await.unwrap();
    let (count, _) = session_b.status().await.unwrap();
    assert_eq!(count, 1);
    let uidls = session_b.uidl().await.unwrap();
    assert_eq!(uidls.len(), 1);
    assert_eq!(uidls[0].0, 1);
    assert!(second.message_id.contains(&uidls[0].1));
    session_b.quit().await.unwrap();
}

#[tokio::test]
async fn test_dele_without_quit_is_discarded() {
    let h = harness(|_| {}).await;
    SmtpSender::new(sender_config(&h))
        .send(&sample_message("survivor"))
        .await
        .unwrap();

    // DELE then drop the connection without QUIT
    {
        let mut fetcher = Pop3Fetcher::new(fetcher_config(&h));
        fetcher.connect().await.unwrap();
        fetcher.delete(1).await.unwrap();
        // fetcher dropped here without quit()
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut fetcher = Pop3Fetcher::new(fetcher_config(&h));
    fetcher.connect().await.unwrap();
    let (count, _) = fetcher.status().await.unwrap();
    assert_eq!(count, 1);
    fetcher.quit().await.unwrap();
}

#[tokio::test]
async fn test_retrieve_all_with_filter() {
    let h = harness(|_| {}).await;
    let sender = SmtpSender::new(sender_config(&h));
    sender.send(&sample_message("project alpha update")).await.unwrap();
    sender.send(&sample_message("lunch plans")).await.unwrap();

    let mut fetcher = Pop3Fetcher::new(fetcher_config(&h));
    fetcher.connect().await.unwrap();

    let filter = MessageFilter {
        subject_contains: Some("alpha".to_string()),
        ..Default::default()
    };
    let messages = fetcher.retrieve_all(&filter, false).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].subject, "project alpha update");
    fetcher.quit().await.unwrap();
}

#[tokio::test]
async fn test_smtp_auth_required_end_to_end() {
    let h = harness(|config| {
        config.smtp.require_auth = true;
    })
    .await;

    // Unauthenticated submission is refused permanently
    let err = SmtpSender::new(sender_config(&h))
        .send(&sample_message("no auth"))
        .await
        .unwrap_err();
    match err {
        postbox::MailError::Rejected { code, .. } => assert_eq!(code, 530),
        other => panic!("unexpected error: {}", other),
    }

    // With credentials the same submission goes through
    let config = sender_config(&h).credentials("bob", "hunter2");
    SmtpSender::new(config)
        .send(&sample_message("authed"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_pop3_connection_cap() {
    let h = harness(|config| {
        config.pop3.max_connections = 2;
    })
    .await;

    async fn greet(addr: SocketAddr) -> (TcpStream, String) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        (reader.into_inner(), line)
    }

    let (_held1, g1) = greet(h.pop3_addr).await;
    let (_held2, g2) = greet(h.pop3_addr).await;
    assert!(g1.starts_with("+OK"));
    assert!(g2.starts_with("+OK"));

    // Third connection is turned away before any protocol work
    let (mut refused, busy) = greet(h.pop3_addr).await;
    assert!(busy.starts_with("-ERR server busy"), "{}", busy);
    let mut rest = Vec::new();
    refused.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    // Freeing a slot lets the next connection in
    drop(_held1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (_held4, g4) = greet(h.pop3_addr).await;
    assert!(g4.starts_with("+OK"), "{}", g4);
}

#[tokio::test]
async fn test_smtp_connection_cap_busy_reply() {
    let h = harness(|config| {
        config.smtp.max_connections = 1;
    })
    .await;

    let held = TcpStream::connect(h.smtp_addr).await.unwrap();
    let mut held_reader = BufReader::new(held);
    let mut line = String::new();
    held_reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("220"));

    let refused = TcpStream::connect(h.smtp_addr).await.unwrap();
    let mut refused_reader = BufReader::new(refused);
    let mut busy = String::new();
    refused_reader.read_line(&mut busy).await.unwrap();
    assert!(busy.starts_with("421"), "{}", busy);
}

#[tokio::test]
async fn test_pipelined_commands_answered_in_order() {
    let h = harness(|_| {}).await;

    let stream = TcpStream::connect(h.smtp_addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("220"));

    // EHLO first (multiline reply), then a pipelined burst
    write_half.write_all(b"EHLO c.test\r\n").await.unwrap();
    loop {
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        if line.len() < 4 || &line[3..4] == " " {
            break;
        }
    }

    write_half
        .write_all(b"MAIL FROM:<a@x>\r\nRCPT TO:<bob@example.test>\r\nNOOP\r\n")
        .await
        .unwrap();
    for expected in ["250 2.1.0", "250 2.1.5", "250 2.0.0"] {
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with(expected), "want {} got {}", expected, line);
    }

    write_half.write_all(b"QUIT\r\n").await.unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("221"));
}
