//! POP3 mailbox-service session
//!
//! RFC 1939 state machine: AUTHORIZATION → TRANSACTION → UPDATE. On
//! successful authentication the session freezes a snapshot of the
//! mailbox; message numbers are stable 1..N indexes into that snapshot
//! for the whole session. Deletions are marks that only become real in
//! UPDATE, reached by a clean QUIT; any other ending discards them.

use crate::config::Pop3Config;
use crate::error::{MailError, Result};
use crate::runtime::{dot_stuff, read_frame_line, trim_line_ending, LineLimits, MailStream};
use crate::security::{Authenticator, Principal, TlsSettings};
use crate::storage::{ContentStore, MailStore};
use crate::pop3::commands::Pop3Command;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Command lines are short in POP3; RFC 2449 caps them at 255 octets.
const MAX_COMMAND_LINE: usize = 255;

/// Protocol violations tolerated before the session is dropped.
const MAX_ERRORS: usize = 10;

/// UIDL arguments are 1..70 printable characters.
const MAX_UIDL_LEN: usize = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pop3State {
    Authorization,
    Transaction,
}

enum Flow {
    /// Restart command processing (after an STLS upgrade).
    Continue,
    Quit,
}

/// One frozen mailbox entry. `number` is its stable session index.
struct SnapshotEntry {
    message_id: String,
    uidl: String,
    size: i64,
    content_path: String,
    deleted: bool,
    retrieved: bool,
}

pub struct Pop3Session {
    hostname: String,
    config: Pop3Config,
    store: MailStore,
    content: ContentStore,
    authenticator: Authenticator,
    tls: Option<TlsSettings>,

    state: Pop3State,
    pending_user: Option<String>,
    principal: Option<Principal>,
    snapshot: Vec<SnapshotEntry>,
    apop_nonce: String,
    tls_active: bool,
    error_count: usize,
    started_at: Instant,
}

impl Pop3Session {
    pub fn new(
        hostname: String,
        config: Pop3Config,
        store: MailStore,
        content: ContentStore,
        authenticator: Authenticator,
        tls: Option<TlsSettings>,
    ) -> Self {
        let apop_nonce = authenticator.issue_apop_nonce(&hostname);
        Self {
            hostname,
            config,
            store,
            content,
            authenticator,
            tls,
            state: Pop3State::Authorization,
            pending_user: None,
            principal: None,
            snapshot: Vec::new(),
            apop_nonce,
            tls_active: false,
            error_count: 0,
            started_at: Instant::now(),
        }
    }

    pub async fn handle<S>(
        mut self,
        mut stream: MailStream<S>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.tls_active = stream.is_tls();

        // The angle-bracket token doubles as the APOP challenge
        let greeting = format!("+OK POP3 server ready {}\r\n", self.apop_nonce);
        stream.write_all(greeting.as_bytes()).await?;

        loop {
            match self.process_commands(&mut stream, &shutdown).await? {
                Flow::Continue => continue,
                Flow::Quit => break,
            }
        }
        Ok(())
    }

    fn read_window(&self) -> Duration {
        let idle = Duration::from_secs(self.config.idle_timeout_secs);
        let total = Duration::from_secs(self.config.session_timeout_secs);
        total
            .checked_sub(self.started_at.elapsed())
            .map(|left| left.min(idle))
            .unwrap_or(Duration::ZERO)
    }

    async fn process_commands<S>(
        &mut self,
        stream: &mut MailStream<S>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Flow>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut reader = BufReader::new(&mut *stream);

        loop {
            if self.error_count >= MAX_ERRORS {
                warn!("too many protocol errors, dropping session");
                send(&mut reader, "-ERR too many errors, closing connection\r\n").await?;
                return Ok(Flow::Quit);
            }
            if *shutdown.borrow() {
                send(&mut reader, "-ERR server shutting down\r\n").await?;
                return Ok(Flow::Quit);
            }

            let limits = LineLimits::new(MAX_COMMAND_LINE, self.read_window());
            let line = match read_frame_line(&mut reader, &limits).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("client disconnected; deletions discarded");
                    return Ok(Flow::Quit);
                }
                Err(MailError::Timeout(_)) => {
                    send(&mut reader, "-ERR timeout, closing connection\r\n").await?;
                    return Ok(Flow::Quit);
                }
                Err(MailError::Protocol(_)) => {
                    send(&mut reader, "-ERR line too long, closing connection\r\n").await?;
                    return Ok(Flow::Quit);
                }
                Err(e) => return Err(e),
            };

            let text = String::from_utf8_lossy(trim_line_ending(&line)).to_string();
            if text.to_uppercase().starts_with("PASS") {
                debug!("C: PASS [hidden]");
            } else {
                debug!("C: {}", text);
            }

            let command = match Pop3Command::parse(&text) {
                Ok(command) => command,
                Err(e) => {
                    self.error_count += 1;
                    send(&mut reader, &format!("-ERR {}\r\n", e)).await?;
                    continue;
                }
            };

            match command {
                Pop3Command::Stls => {
                    if !self.stls_allowed(&mut reader).await? {
                        continue;
                    }
                    send(&mut reader, "+OK Begin TLS negotiation\r\n").await?;
                    reader.flush().await?;
                    drop(reader);

                    self.upgrade_to_tls(stream).await?;
                    info!("STLS upgrade complete");
                    return Ok(Flow::Continue);
                }
                Pop3Command::Quit => {
                    let reply = self.quit_reply().await;
                    send(&mut reader, &reply).await?;
                    return Ok(Flow::Quit);
                }
                command => {
                    let reply = self.apply_command(command).await;
                    send_bytes(&mut reader, &reply).await?;
                }
            }
        }
    }

    /// Replies are bytes because RETR/TOP bodies need not be UTF-8.
    async fn apply_command(&mut self, command: Pop3Command) -> Vec<u8> {
        let text = match (self.state, command) {
            (_, Pop3Command::Capa) => self.capa_reply(),
            (_, Pop3Command::Noop) => "+OK\r\n".to_string(),

            (Pop3State::Authorization, Pop3Command::User(name)) => {
                // Accepted unconditionally; existence is never revealed
                self.pending_user = Some(name);
                "+OK password required\r\n".to_string()
            }
            (Pop3State::Authorization, Pop3Command::Pass(password)) => {
                match self.pending_user.take() {
                    Some(username) => self.login(&username, &password).await,
                    None => {
                        self.error_count += 1;
                        "-ERR USER first\r\n".to_string()
                    }
                }
            }
            (Pop3State::Authorization, Pop3Command::Apop { user, digest }) => {
                match self.authenticator.verify_apop(&user, &self.apop_nonce, &digest).await {
                    Ok(principal) => self.open_mailbox(principal).await,
                    Err(MailError::AuthUnsupported(_)) => {
                        "-ERR APOP not supported\r\n".to_string()
                    }
                    Err(_) => {
                        self.error_count += 1;
                        "-ERR [AUTH] authentication failed\r\n".to_string()
                    }
                }
            }

            (Pop3State::Transaction, Pop3Command::Stat) => {
                let (count, size) = self.mailbox_totals();
                format!("+OK {} {}\r\n", count, size)
            }
            (Pop3State::Transaction, Pop3Command::List(None)) => {
                let (count, size) = self.mailbox_totals();
                let mut reply = format!("+OK {} messages ({} octets)\r\n", count, size);
                for (i, entry) in self.snapshot.iter().enumerate() {
                    if !entry.deleted {
                        reply.push_str(&format!("{} {}\r\n", i + 1, entry.size));
                    }
                }
                reply.push_str(".\r\n");
                reply
            }
            (Pop3State::Transaction, Pop3Command::List(Some(n))) => match self.entry(n) {
                Ok(entry) => format!("+OK {} {}\r\n", n, entry.size),
                Err(reply) => reply,
            },
            (Pop3State::Transaction, Pop3Command::Uidl(None)) => {
                let mut reply = "+OK\r\n".to_string();
                for (i, entry) in self.snapshot.iter().enumerate() {
                    if !entry.deleted {
                        reply.push_str(&format!("{} {}\r\n", i + 1, entry.uidl));
                    }
                }
                reply.push_str(".\r\n");
                reply
            }
            (Pop3State::Transaction, Pop3Command::Uidl(Some(n))) => match self.entry(n) {
                Ok(entry) => format!("+OK {} {}\r\n", n, entry.uidl),
                Err(reply) => reply,
            },
            (Pop3State::Transaction, Pop3Command::Retr(n)) => {
                return self.retr(n, None).await;
            }
            (Pop3State::Transaction, Pop3Command::Top { msg, lines }) => {
                return self.retr(msg, Some(lines)).await;
            }
            (Pop3State::Transaction, Pop3Command::Dele(n)) => match self.entry_index(n) {
                Ok(index) => {
                    self.snapshot[index].deleted = true;
                    info!("message {} marked for deletion", n);
                    format!("+OK message {} deleted\r\n", n)
                }
                Err(reply) => reply,
            },
            (Pop3State::Transaction, Pop3Command::Rset) => {
                for entry in &mut self.snapshot {
                    entry.deleted = false;
                }
                let (count, size) = self.mailbox_totals();
                format!("+OK maildrop has {} messages ({} octets)\r\n", count, size)
            }

            (_, Pop3Command::Unknown(verb)) => {
                self.error_count += 1;
                format!("-ERR unknown command: {}\r\n", verb)
            }
            _ => {
                self.error_count += 1;
                "-ERR command not valid in this state\r\n".to_string()
            }
        };
        text.into_bytes()
    }

    async fn login(&mut self, username: &str, password: &str) -> String {
        match self.authenticator.verify(username, password).await {
            Ok(principal) => self.open_mailbox(principal).await,
            Err(MailError::AuthFailed) => {
                self.error_count += 1;
                "-ERR [AUTH] authentication failed\r\n".to_string()
            }
            Err(e) => {
                error!("authentication backend error: {}", e);
                "-ERR temporary failure, try again later\r\n".to_string()
            }
        }
    }

    /// Freeze the mailbox snapshot and enter TRANSACTION.
    async fn open_mailbox(&mut self, principal: Principal) -> String {
        let records = match self.store.inbox_for_recipient(&principal.email).await {
            Ok(records) => records,
            Err(e) => {
                error!("cannot load mailbox for {}: {}", principal.email, e);
                return "-ERR temporary failure, try again later\r\n".to_string();
            }
        };

        self.snapshot = records
            .into_iter()
            .map(|r| SnapshotEntry {
                uidl: uidl_token(&r.message_id),
                message_id: r.message_id,
                size: r.size,
                content_path: r.content_path,
                deleted: false,
                retrieved: false,
            })
            .collect();
        self.state = Pop3State::Transaction;

        let (count, size) = self.mailbox_totals();
        info!(
            "{} logged in, {} messages ({} octets)",
            principal.username, count, size
        );
        self.principal = Some(principal);
        format!("+OK {} messages ({} octets)\r\n", count, size)
    }

    fn mailbox_totals(&self) -> (usize, i64) {
        let live = self.snapshot.iter().filter(|e| !e.deleted);
        let (mut count, mut size) = (0usize, 0i64);
        for entry in live {
            count += 1;
            size += entry.size;
        }
        (count, size)
    }

    fn entry_index(&self, n: usize) -> std::result::Result<usize, String> {
        if n == 0 || n > self.snapshot.len() {
            return Err(format!(
                "-ERR no such message, only {} messages in maildrop\r\n",
                self.snapshot.len()
            ));
        }
        if self.snapshot[n - 1].deleted {
            return Err(format!("-ERR message {} already deleted\r\n", n));
        }
        Ok(n - 1)
    }

    fn entry(&self, n: usize) -> std::result::Result<&SnapshotEntry, String> {
        self.entry_index(n).map(|i| &self.snapshot[i])
    }

    /// RETR, or TOP when `top_lines` is set: headers plus that many body
    /// lines. Either way the payload is CRLF-normalized, dot-stuffed and
    /// closed with a lone dot.
    async fn retr(&mut self, n: usize, top_lines: Option<usize>) -> Vec<u8> {
        let index = match self.entry_index(n) {
            Ok(index) => index,
            Err(reply) => return reply.into_bytes(),
        };

        let (message_id, content_path) = {
            let entry = &self.snapshot[index];
            (entry.message_id.clone(), entry.content_path.clone())
        };
        let hint = std::path::Path::new(&content_path);
        let bytes = match self.content.get(&message_id, Some(hint)).await {
            Ok(bytes) => bytes,
            Err(MailError::NotFound(_)) => {
                error!("content missing for {}", message_id);
                return format!("-ERR message {} not available\r\n", n).into_bytes();
            }
            Err(e) => {
                error!("content read failed for {}: {}", message_id, e);
                return b"-ERR temporary failure, try again later\r\n".to_vec();
            }
        };

        let payload = match top_lines {
            None => bytes,
            Some(k) => head_of_message(&bytes, k),
        };

        let mut reply = match top_lines {
            None => {
                self.snapshot[index].retrieved = true;
                format!("+OK {} octets\r\n", payload.len()).into_bytes()
            }
            Some(_) => b"+OK top of message follows\r\n".to_vec(),
        };
        reply.extend_from_slice(&dot_stuff(&payload));
        reply.extend_from_slice(b".\r\n");
        reply
    }

    /// QUIT from TRANSACTION enters UPDATE: apply deletion marks and read
    /// flags in one transaction, then sign off.
    async fn quit_reply(&mut self) -> String {
        if self.state != Pop3State::Transaction {
            return format!("+OK {} POP3 server signing off\r\n", self.hostname);
        }

        let deleted: Vec<String> = self
            .snapshot
            .iter()
            .filter(|e| e.deleted)
            .map(|e| e.message_id.clone())
            .collect();
        let read: Vec<String> = self
            .snapshot
            .iter()
            .filter(|e| e.retrieved && !e.deleted)
            .map(|e| e.message_id.clone())
            .collect();

        match self.store.commit_mailbox_update(&deleted, &read).await {
            Ok(()) => format!(
                "+OK {} POP3 server signing off ({} messages deleted)\r\n",
                self.hostname,
                deleted.len()
            ),
            Err(e) => {
                error!("UPDATE failed: {}", e);
                "-ERR some deleted messages not removed\r\n".to_string()
            }
        }
    }

    fn capa_reply(&self) -> String {
        let mut reply = String::from("+OK capability list follows\r\n");
        reply.push_str("USER\r\n");
        reply.push_str("TOP\r\n");
        reply.push_str("UIDL\r\n");
        reply.push_str("PIPELINING\r\n");
        reply.push_str("RESP-CODES\r\n");
        if self.tls.is_some() && !self.tls_active {
            reply.push_str("STLS\r\n");
        }
        reply.push_str(".\r\n");
        reply
    }

    async fn stls_allowed<W>(&mut self, w: &mut W) -> Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        if self.state != Pop3State::Authorization {
            self.error_count += 1;
            send(w, "-ERR STLS only before authentication\r\n").await?;
            return Ok(false);
        }
        if self.tls.is_none() {
            send(w, "-ERR STLS not supported\r\n").await?;
            return Ok(false);
        }
        if self.tls_active {
            self.error_count += 1;
            send(w, "-ERR TLS already active\r\n").await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Swap in the TLS transport and discard all authorization state
    /// (RFC 2595 §4: the client starts over).
    async fn upgrade_to_tls<S>(&mut self, stream: &mut MailStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let tls = self.tls.as_ref().expect("checked in stls_allowed");
        let acceptor = tls.acceptor();

        let plain = match std::mem::replace(stream, MailStream::Upgrading) {
            MailStream::Plain(plain) => plain,
            other => {
                *stream = other;
                return Err(MailError::Tls("stream not plaintext".to_string()));
            }
        };

        let tls_stream = acceptor
            .accept(plain)
            .await
            .map_err(|e| MailError::Tls(format!("handshake failed: {}", e)))?;
        *stream = MailStream::Tls(Box::new(tls_stream));

        self.tls_active = true;
        self.pending_user = None;
        self.principal = None;
        Ok(())
    }
}

async fn send<W>(w: &mut W, reply: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug!("S: {}", reply.trim_end());
    w.write_all(reply.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

async fn send_bytes<W>(w: &mut W, reply: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if reply.len() <= 120 {
        debug!("S: {}", String::from_utf8_lossy(reply).trim_end());
    } else {
        debug!("S: {} byte reply", reply.len());
    }
    w.write_all(reply).await?;
    w.flush().await?;
    Ok(())
}

/// Make a message-id safe for the UIDL grammar: 1..70 printable ASCII
/// characters, no spaces, angle brackets stripped.
fn uidl_token(message_id: &str) -> String {
    let mut token: String = message_id
        .trim()
        .trim_matches(['<', '>'])
        .chars()
        .map(|c| {
            if ('\u{21}'..='\u{7e}').contains(&c) {
                c
            } else {
                '_'
            }
        })
        .collect();
    token.truncate(MAX_UIDL_LEN);
    if token.is_empty() {
        "_".to_string()
    } else {
        token
    }
}

/// Header block, blank separator and the first `k` body lines.
fn head_of_message(bytes: &[u8], k: usize) -> Vec<u8> {
    let split = find_body_start(bytes);
    let mut out = bytes[..split].to_vec();

    let body = &bytes[split..];
    let mut taken = 0;
    for line in body.split_inclusive(|&b| b == b'\n') {
        if taken >= k {
            break;
        }
        out.extend_from_slice(line);
        taken += 1;
    }
    out
}

/// Offset just past the header/body separator (start of the body).
fn find_body_start(bytes: &[u8]) -> usize {
    if let Some(pos) = bytes.windows(4).position(|w| w == b"\r\n\r\n") {
        pos + 4
    } else if let Some(pos) = bytes.windows(2).position(|w| w == b"\n\n") {
        pos + 2
    } else {
        bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::{Duration as ChronoDuration, Utc};
    use crate::storage::MailRecord;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};

    struct Fixture {
        store: MailStore,
        content: ContentStore,
        authenticator: Authenticator,
        _dir: TempDir,
        config: Pop3Config,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = MailStore::open("sqlite::memory:").await.unwrap();
        let authenticator = Authenticator::new(store.clone()).unwrap();
        authenticator
            .add_user("alice", "alice@test", "s3cret")
            .await
            .unwrap();
        Fixture {
            store,
            content: ContentStore::new(dir.path()),
            authenticator,
            _dir: dir,
            config: Config::default().pop3,
        }
    }

    /// Insert a message with content, aged so insertion order is date order.
    async fn seed(fx: &Fixture, id: &str, body: &[u8], age_hours: i64) {
        let path = fx.content.put(id, body).await.unwrap();
        let mut record = MailRecord::new(id, "sender@remote", vec!["alice@test".to_string()]);
        record.size = body.len() as i64;
        record.date = Utc::now() - ChronoDuration::hours(age_hours);
        record.content_path = path.to_string_lossy().to_string();
        fx.store.insert_inbox(&record).await.unwrap();
    }

    fn start(fx: &Fixture) -> tokio::io::DuplexStream {
        let session = Pop3Session::new(
            "mail.test".to_string(),
            fx.config.clone(),
            fx.store.clone(),
            fx.content.clone(),
            fx.authenticator.clone(),
            None,
        );
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            let _ = session.handle(MailStream::Plain(server), rx).await;
        });
        client
    }

    type Client = (
        TokioBufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    );

    fn split(client: tokio::io::DuplexStream) -> Client {
        let (read_half, write_half) = tokio::io::split(client);
        (TokioBufReader::new(read_half), write_half)
    }

    async fn read_line(c: &mut Client) -> String {
        let mut line = String::new();
        c.0.read_line(&mut line).await.unwrap();
        line
    }

    /// Read lines until the lone-dot terminator, unstuffed.
    async fn read_multiline(c: &mut Client) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = read_line(c).await;
            let content = line.trim_end_matches(['\r', '\n']);
            if content == "." {
                break;
            }
            let content = if content.starts_with("..") {
                &content[1..]
            } else {
                content
            };
            lines.push(content.to_string());
        }
        lines
    }

    async fn login(c: &mut Client) -> String {
        c.1.write_all(b"USER alice\r\n").await.unwrap();
        assert!(read_line(c).await.starts_with("+OK"));
        c.1.write_all(b"PASS s3cret\r\n").await.unwrap();
        read_line(c).await
    }

    #[tokio::test]
    async fn test_greeting_carries_apop_token() {
        let fx = fixture().await;
        let mut c = split(start(&fx));
        let greeting = read_line(&mut c).await;
        assert!(greeting.starts_with("+OK POP3 server ready <"), "{}", greeting);
        assert!(greeting.contains("@mail.test>"));
    }

    #[tokio::test]
    async fn test_login_and_stat() {
        let fx = fixture().await;
        let b1: &[u8] = b"From: a@x\r\n\r\nfirst\r\n";
        let b2: &[u8] = b"From: a@x\r\n\r\nsecond message\r\n";
        seed(&fx, "<m1@x>", b1, 2).await;
        seed(&fx, "<m2@x>", b2, 1).await;

        let mut c = split(start(&fx));
        read_line(&mut c).await;
        let reply = login(&mut c).await;
        assert!(reply.starts_with("+OK 2 messages"), "{}", reply);

        c.1.write_all(b"STAT\r\n").await.unwrap();
        let stat = read_line(&mut c).await;
        assert_eq!(stat, format!("+OK 2 {}\r\n", b1.len() + b2.len()));
    }

    #[tokio::test]
    async fn test_user_never_reveals_existence() {
        let fx = fixture().await;
        let mut c = split(start(&fx));
        read_line(&mut c).await;

        c.1.write_all(b"USER ghost\r\n").await.unwrap();
        assert!(read_line(&mut c).await.starts_with("+OK"));
        c.1.write_all(b"PASS whatever\r\n").await.unwrap();
        assert!(read_line(&mut c).await.starts_with("-ERR [AUTH]"));
    }

    #[tokio::test]
    async fn test_apop_refused_with_hashed_store() {
        let fx = fixture().await;
        let mut c = split(start(&fx));
        read_line(&mut c).await;

        c.1.write_all(b"APOP alice c4c9334bac560ecc979e58001b3e22fb\r\n")
            .await
            .unwrap();
        assert!(read_line(&mut c).await.starts_with("-ERR APOP not supported"));
    }

    #[tokio::test]
    async fn test_list_and_uidl() {
        let fx = fixture().await;
        seed(&fx, "<m1@x>", b"body one\r\n", 2).await;
        seed(&fx, "<m2@x>", b"body two longer\r\n", 1).await;

        let mut c = split(start(&fx));
        read_line(&mut c).await;
        login(&mut c).await;

        c.1.write_all(b"LIST\r\n").await.unwrap();
        assert!(read_line(&mut c).await.starts_with("+OK 2 messages"));
        let listing = read_multiline(&mut c).await;
        assert_eq!(listing, vec!["1 10", "2 17"]);

        c.1.write_all(b"UIDL\r\n").await.unwrap();
        read_line(&mut c).await;
        let uidls = read_multiline(&mut c).await;
        assert_eq!(uidls, vec!["1 m1@x", "2 m2@x"]);

        c.1.write_all(b"LIST 2\r\n").await.unwrap();
        assert_eq!(read_line(&mut c).await, "+OK 2 17\r\n");
        c.1.write_all(b"LIST 9\r\n").await.unwrap();
        assert!(read_line(&mut c).await.starts_with("-ERR no such message"));
    }

    #[tokio::test]
    async fn test_retr_roundtrips_stored_bytes() {
        let fx = fixture().await;
        let body = b"Subject: t\r\n\r\n.leading dot line\r\nplain line\r\n";
        seed(&fx, "<m1@x>", body, 1).await;

        let mut c = split(start(&fx));
        read_line(&mut c).await;
        login(&mut c).await;

        c.1.write_all(b"RETR 1\r\n").await.unwrap();
        let status = read_line(&mut c).await;
        assert_eq!(status, format!("+OK {} octets\r\n", body.len()));

        let lines = read_multiline(&mut c).await;
        let rebuilt = lines.join("\r\n") + "\r\n";
        assert_eq!(rebuilt.as_bytes(), body);
    }

    #[tokio::test]
    async fn test_top_limits_body_lines() {
        let fx = fixture().await;
        let body = b"Subject: t\r\nFrom: a@x\r\n\r\nline1\r\nline2\r\nline3\r\n";
        seed(&fx, "<m1@x>", body, 1).await;

        let mut c = split(start(&fx));
        read_line(&mut c).await;
        login(&mut c).await;

        c.1.write_all(b"TOP 1 1\r\n").await.unwrap();
        assert!(read_line(&mut c).await.starts_with("+OK"));
        let lines = read_multiline(&mut c).await;
        assert_eq!(lines, vec!["Subject: t", "From: a@x", "", "line1"]);
    }

    #[tokio::test]
    async fn test_dele_quit_commits_and_numbering_stays_stable() {
        let fx = fixture().await;
        seed(&fx, "<m1@x>", &vec![b'a'; 100], 2).await;
        seed(&fx, "<m2@x>", &vec![b'b'; 200], 1).await;

        // Session A deletes message 1
        let mut c = split(start(&fx));
        read_line(&mut c).await;
        login(&mut c).await;

        c.1.write_all(b"STAT\r\n").await.unwrap();
        assert_eq!(read_line(&mut c).await, "+OK 2 300\r\n");

        c.1.write_all(b"DELE 1\r\n").await.unwrap();
        assert!(read_line(&mut c).await.starts_with("+OK"));

        // Numbering is frozen: message 2 keeps its number after the DELE
        c.1.write_all(b"LIST\r\n").await.unwrap();
        read_line(&mut c).await;
        assert_eq!(read_multiline(&mut c).await, vec!["2 200"]);

        // Deleted entries refuse further commands
        c.1.write_all(b"RETR 1\r\n").await.unwrap();
        assert!(read_line(&mut c).await.starts_with("-ERR message 1 already deleted"));

        c.1.write_all(b"QUIT\r\n").await.unwrap();
        assert!(read_line(&mut c).await.starts_with("+OK"));

        // Session B sees only m2, renumbered from 1
        let mut c = split(start(&fx));
        read_line(&mut c).await;
        login(&mut c).await;
        c.1.write_all(b"STAT\r\n").await.unwrap();
        assert_eq!(read_line(&mut c).await, "+OK 1 200\r\n");
        c.1.write_all(b"UIDL 1\r\n").await.unwrap();
        assert_eq!(read_line(&mut c).await, "+OK 1 m2@x\r\n");
    }

    #[tokio::test]
    async fn test_rset_discards_deletions() {
        let fx = fixture().await;
        seed(&fx, "<m1@x>", b"one\r\n", 2).await;
        seed(&fx, "<m2@x>", b"two\r\n", 1).await;

        let mut c = split(start(&fx));
        read_line(&mut c).await;
        login(&mut c).await;

        c.1.write_all(b"DELE 1\r\n").await.unwrap();
        read_line(&mut c).await;
        c.1.write_all(b"RSET\r\n").await.unwrap();
        assert!(read_line(&mut c).await.starts_with("+OK maildrop has 2"));
        c.1.write_all(b"QUIT\r\n").await.unwrap();
        read_line(&mut c).await;

        let mut c = split(start(&fx));
        read_line(&mut c).await;
        let reply = login(&mut c).await;
        assert!(reply.starts_with("+OK 2 messages"), "{}", reply);
    }

    #[tokio::test]
    async fn test_abnormal_close_discards_deletions() {
        let fx = fixture().await;
        seed(&fx, "<m1@x>", b"one\r\n", 1).await;

        let mut c = split(start(&fx));
        read_line(&mut c).await;
        login(&mut c).await;
        c.1.write_all(b"DELE 1\r\n").await.unwrap();
        read_line(&mut c).await;
        // Drop without QUIT
        drop(c);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut c = split(start(&fx));
        read_line(&mut c).await;
        let reply = login(&mut c).await;
        assert!(reply.starts_with("+OK 1 messages"), "{}", reply);
    }

    #[tokio::test]
    async fn test_transaction_commands_refused_before_auth() {
        let fx = fixture().await;
        let mut c = split(start(&fx));
        read_line(&mut c).await;

        for cmd in ["STAT\r\n", "LIST\r\n", "RETR 1\r\n", "DELE 1\r\n"] {
            c.1.write_all(cmd.as_bytes()).await.unwrap();
            let reply = read_line(&mut c).await;
            assert!(
                reply.starts_with("-ERR command not valid"),
                "{} -> {}",
                cmd.trim(),
                reply
            );
        }
    }

    #[tokio::test]
    async fn test_capa_lists_extensions() {
        let fx = fixture().await;
        let mut c = split(start(&fx));
        read_line(&mut c).await;

        c.1.write_all(b"CAPA\r\n").await.unwrap();
        assert!(read_line(&mut c).await.starts_with("+OK"));
        let caps = read_multiline(&mut c).await;
        assert!(caps.contains(&"UIDL".to_string()));
        assert!(caps.contains(&"TOP".to_string()));
        assert!(caps.contains(&"PIPELINING".to_string()));
        // No TLS material configured, so STLS is not offered
        assert!(!caps.contains(&"STLS".to_string()));
    }

    #[test]
    fn test_uidl_token_grammar() {
        assert_eq!(uidl_token("<abc.123@x.com>"), "abc.123@x.com");
        assert_eq!(uidl_token("<with space@x>"), "with_space@x");
        let long = format!("<{}@x>", "a".repeat(100));
        assert!(uidl_token(&long).len() <= MAX_UIDL_LEN);
    }

    #[test]
    fn test_head_of_message() {
        let bytes = b"H: v\r\n\r\nb1\r\nb2\r\n";
        assert_eq!(head_of_message(bytes, 1), b"H: v\r\n\r\nb1\r\n");
        assert_eq!(head_of_message(bytes, 0), b"H: v\r\n\r\n");
        assert_eq!(head_of_message(bytes, 99), bytes);
    }
}
