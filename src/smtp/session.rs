//! SMTP receive-side session
//!
//! Drives one connection through the RFC 5321 state machine:
//! greeting → EHLO → (STARTTLS) → (AUTH) → MAIL → RCPT → DATA → commit.
//! A committed message is durable in both the content store and the inbox
//! table before the 250 goes out; any failure between the two removes the
//! content file and reports a retryable 451.

use crate::config::SmtpConfig;
use crate::error::{MailError, Result};
use crate::message::mime::{decode_rfc2047, MimeParser};
use crate::message::{generate_message_id, Address};
use crate::runtime::{
    dot_unstuff_line, read_frame_line, trim_line_ending, LineLimits, MailStream,
};
use crate::security::{AuthMechanism, Authenticator, Principal, TlsSettings};
use crate::smtp::commands::SmtpCommand;
use crate::storage::{ContentStore, MailRecord, MailStore};
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Command lines are capped at 512 octets including CRLF (RFC 5321).
const MAX_COMMAND_LINE: usize = 512;

/// DATA payload lines are capped at 1000 octets plus CRLF.
const MAX_DATA_LINE: usize = 1002;

/// Protocol violations tolerated before the session is dropped.
const MAX_ERRORS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmtpState {
    /// Connected, no EHLO yet.
    Fresh,
    /// EHLO/HELO done, no open envelope.
    Greeted,
    /// Reverse-path recorded.
    MailFrom,
    /// At least one forward-path recorded; DATA may start.
    RcptTo,
}

enum Flow {
    /// Restart command processing (after a STARTTLS upgrade).
    Continue,
    Quit,
}

pub struct SmtpSession {
    hostname: String,
    domain: String,
    config: SmtpConfig,
    store: MailStore,
    content: ContentStore,
    authenticator: Option<Authenticator>,
    tls: Option<TlsSettings>,

    state: SmtpState,
    ehlo_domain: Option<String>,
    reverse_path: Option<String>,
    forward_paths: Vec<String>,
    principal: Option<Principal>,
    tls_active: bool,
    error_count: usize,
    bytes_in: u64,
    bytes_out: u64,
    started_at: Instant,
}

impl SmtpSession {
    pub fn new(
        hostname: String,
        domain: String,
        config: SmtpConfig,
        store: MailStore,
        content: ContentStore,
        authenticator: Option<Authenticator>,
        tls: Option<TlsSettings>,
    ) -> Self {
        Self {
            hostname,
            domain,
            config,
            store,
            content,
            authenticator,
            tls,
            state: SmtpState::Fresh,
            ehlo_domain: None,
            reverse_path: None,
            forward_paths: Vec::new(),
            principal: None,
            tls_active: false,
            error_count: 0,
            bytes_in: 0,
            bytes_out: 0,
            started_at: Instant::now(),
        }
    }

    /// Run the session to completion on the given stream.
    pub async fn handle<S>(
        mut self,
        mut stream: MailStream<S>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.tls_active = stream.is_tls();

        let banner = format!("220 {} ESMTP service ready\r\n", self.hostname);
        stream.write_all(banner.as_bytes()).await?;
        self.bytes_out += banner.len() as u64;

        loop {
            match self.process_commands(&mut stream, &shutdown).await? {
                Flow::Continue => continue,
                Flow::Quit => break,
            }
        }

        debug!(
            "SMTP session done: {} bytes in, {} bytes out",
            self.bytes_in, self.bytes_out
        );
        Ok(())
    }

    /// Remaining read window: the idle timeout bounded by the absolute
    /// session deadline.
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
                self.send(&mut reader, "421 4.7.0 Too many errors, closing connection\r\n")
                    .await?;
                return Ok(Flow::Quit);
            }
            if *shutdown.borrow() {
                self.send(
                    &mut reader,
                    &format!("421 4.3.2 {} shutting down\r\n", self.hostname),
                )
                .await?;
                return Ok(Flow::Quit);
            }

            let limits = LineLimits::new(MAX_COMMAND_LINE, self.read_window());
            let line = match read_frame_line(&mut reader, &limits).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("client disconnected");
                    return Ok(Flow::Quit);
                }
                Err(MailError::Timeout(_)) => {
                    self.send(
                        &mut reader,
                        &format!("421 4.4.2 {} timeout, closing connection\r\n", self.hostname),
                    )
                    .await?;
                    return Ok(Flow::Quit);
                }
                Err(MailError::Protocol(_)) => {
                    // An overlong line desyncs the command stream
                    self.send(&mut reader, "500 5.5.2 Line too long, closing connection\r\n")
                        .await?;
                    return Ok(Flow::Quit);
                }
                Err(e) => return Err(e),
            };
            self.bytes_in += line.len() as u64;

            let text = String::from_utf8_lossy(trim_line_ending(&line)).to_string();
            debug!("C: {}", text);

            let command = match SmtpCommand::parse(&text) {
                Ok(command) => command,
                Err(e) => {
                    debug!("unparseable command: {}", e);
                    self.error_count += 1;
                    self.send(&mut reader, "500 5.5.2 Syntax error\r\n").await?;
                    continue;
                }
            };

            match command {
                SmtpCommand::StartTls => {
                    if !self.starttls_allowed(&mut reader).await? {
                        continue;
                    }
                    self.send(&mut reader, "220 2.0.0 Ready to start TLS\r\n")
                        .await?;
                    reader.flush().await?;
                    drop(reader);

                    self.upgrade_to_tls(stream).await?;
                    info!("STARTTLS upgrade complete");
                    return Ok(Flow::Continue);
                }
                SmtpCommand::Auth { mechanism, initial } => {
                    self.handle_auth(&mut reader, &mechanism, initial).await?;
                }
                SmtpCommand::Quit => {
                    self.send(
                        &mut reader,
                        &format!("221 2.0.0 {} closing connection\r\n", self.hostname),
                    )
                    .await?;
                    return Ok(Flow::Quit);
                }
                command => {
                    let reply = self.apply_command(command);
                    self.send(&mut reader, &reply).await?;

                    if self.state == SmtpState::RcptTo && reply.starts_with("354") {
                        let reply = match self.receive_data(&mut reader).await {
                            Ok(reply) => reply,
                            Err(e) => {
                                error!("DATA aborted: {}", e);
                                return Err(e);
                            }
                        };
                        self.send(&mut reader, &reply).await?;
                    }
                }
            }
        }
    }

    /// State-machine dispatch for the commands that need no extra I/O.
    fn apply_command(&mut self, command: SmtpCommand) -> String {
        match (self.state, command) {
            (_, SmtpCommand::Helo(domain)) => {
                info!("HELO {}", domain);
                self.reset_envelope();
                self.ehlo_domain = Some(domain.clone());
                self.state = SmtpState::Greeted;
                format!("250 {} Hello {}\r\n", self.hostname, domain)
            }
            (_, SmtpCommand::Ehlo(domain)) => {
                info!("EHLO {}", domain);
                self.reset_envelope();
                self.ehlo_domain = Some(domain.clone());
                self.state = SmtpState::Greeted;
                self.ehlo_reply(&domain)
            }
            (SmtpState::Greeted, SmtpCommand::MailFrom { reverse_path, declared_size }) => {
                if self.config.require_auth && self.principal.is_none() {
                    warn!("MAIL FROM refused: authentication required");
                    return "530 5.7.0 Authentication required\r\n".to_string();
                }
                if let Some(size) = declared_size {
                    if size > self.config.max_message_size {
                        return "552 5.3.4 Message size exceeds limit\r\n".to_string();
                    }
                }
                // The null reverse-path <> is legal (bounces)
                if !reverse_path.is_empty() {
                    if let Err(e) = Address::parse(&reverse_path) {
                        debug!("bad reverse-path: {}", e);
                        self.error_count += 1;
                        return "501 5.1.7 Bad sender address syntax\r\n".to_string();
                    }
                }
                info!("MAIL FROM:<{}>", reverse_path);
                self.reverse_path = Some(reverse_path);
                self.forward_paths.clear();
                self.state = SmtpState::MailFrom;
                "250 2.1.0 OK\r\n".to_string()
            }
            (SmtpState::MailFrom | SmtpState::RcptTo, SmtpCommand::RcptTo(path)) => {
                if self.forward_paths.len() >= self.config.max_recipients {
                    warn!("recipient cap hit at {}", self.forward_paths.len());
                    return format!(
                        "452 4.5.3 Too many recipients (max {})\r\n",
                        self.config.max_recipients
                    );
                }
                if let Err(e) = Address::parse(&path) {
                    debug!("bad forward-path: {}", e);
                    self.error_count += 1;
                    return "501 5.1.3 Bad recipient address syntax\r\n".to_string();
                }
                info!("RCPT TO:<{}>", path);
                self.forward_paths.push(path);
                self.state = SmtpState::RcptTo;
                "250 2.1.5 OK\r\n".to_string()
            }
            (SmtpState::RcptTo, SmtpCommand::Data) => {
                "354 Start mail input; end with <CRLF>.<CRLF>\r\n".to_string()
            }
            (_, SmtpCommand::Rset) => {
                self.reset_envelope();
                "250 2.0.0 OK\r\n".to_string()
            }
            (_, SmtpCommand::Noop) => "250 2.0.0 OK\r\n".to_string(),
            (_, SmtpCommand::Vrfy(_)) => {
                // Existence is never confirmed nor denied
                "252 2.5.2 Cannot VRFY user, but will accept message\r\n".to_string()
            }
            (_, SmtpCommand::Expn(_)) => "502 5.5.1 EXPN not implemented\r\n".to_string(),
            (_, SmtpCommand::Unknown(verb)) => {
                debug!("unknown command {}", verb);
                self.error_count += 1;
                "502 5.5.1 Command not implemented\r\n".to_string()
            }
            _ => {
                self.error_count += 1;
                "503 5.5.1 Bad sequence of commands\r\n".to_string()
            }
        }
    }

    /// Capabilities reflect the current session: STARTTLS disappears once
    /// TLS is active, AUTH once authenticated.
    fn ehlo_reply(&self, domain: &str) -> String {
        let mut caps: Vec<String> = vec![
            format!("SIZE {}", self.config.max_message_size),
            "8BITMIME".to_string(),
            "PIPELINING".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
        ];
        if self.tls.is_some() && !self.tls_active {
            caps.push("STARTTLS".to_string());
        }
        if self.authenticator.is_some()
            && self.principal.is_none()
            && (!self.config.auth_requires_tls || self.tls_active)
        {
            caps.push("AUTH PLAIN LOGIN".to_string());
        }

        let mut reply = format!("250-{} Hello {}\r\n", self.hostname, domain);
        for (i, cap) in caps.iter().enumerate() {
            let sep = if i + 1 == caps.len() { ' ' } else { '-' };
            reply.push_str(&format!("250{}{}\r\n", sep, cap));
        }
        reply
    }

    fn reset_envelope(&mut self) {
        self.reverse_path = None;
        self.forward_paths.clear();
        if self.ehlo_domain.is_some() {
            self.state = SmtpState::Greeted;
        } else {
            self.state = SmtpState::Fresh;
        }
    }

    async fn starttls_allowed<W>(&mut self, w: &mut W) -> Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        if self.tls.is_none() {
            self.send(w, "454 4.7.0 TLS not available\r\n").await?;
            return Ok(false);
        }
        if self.tls_active {
            self.error_count += 1;
            self.send(w, "503 5.5.1 TLS already active\r\n").await?;
            return Ok(false);
        }
        if self.state == SmtpState::Fresh {
            self.error_count += 1;
            self.send(w, "503 5.5.1 Send EHLO first\r\n").await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Swap the plain transport for TLS and reset all protocol state
    /// (RFC 3207 §4.2: the client must start over with EHLO).
    async fn upgrade_to_tls<S>(&mut self, stream: &mut MailStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let tls = self.tls.as_ref().expect("checked in starttls_allowed");
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
        self.ehlo_domain = None;
        self.principal = None;
        self.reset_envelope();
        Ok(())
    }

    async fn handle_auth<R>(
        &mut self,
        reader: &mut R,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<()>
    where
        R: tokio::io::AsyncBufRead + AsyncWrite + Unpin,
    {
        if self.authenticator.is_none() {
            self.send(reader, "502 5.5.1 Authentication not available\r\n")
                .await?;
            return Ok(());
        }
        if self.ehlo_domain.is_none() {
            self.error_count += 1;
            self.send(reader, "503 5.5.1 Send EHLO first\r\n").await?;
            return Ok(());
        }
        if self.principal.is_some() {
            self.error_count += 1;
            self.send(reader, "503 5.5.1 Already authenticated\r\n").await?;
            return Ok(());
        }
        if self.config.auth_requires_tls && !self.tls_active {
            warn!("AUTH refused on plaintext connection");
            self.send(
                reader,
                "538 5.7.11 Encryption required for requested authentication mechanism\r\n",
            )
            .await?;
            return Ok(());
        }

        let Some(mechanism) = AuthMechanism::from_str(mechanism) else {
            self.error_count += 1;
            self.send(reader, "504 5.5.4 Mechanism not supported\r\n").await?;
            return Ok(());
        };

        let credentials = match mechanism {
            AuthMechanism::Plain => {
                let blob = match initial {
                    Some(blob) if blob != "=" => blob,
                    _ => {
                        self.send(reader, "334 \r\n").await?;
                        let Some(line) = self.read_auth_line(reader).await? else {
                            return Ok(());
                        };
                        line
                    }
                };
                Authenticator::decode_plain(&blob)
            }
            AuthMechanism::Login => {
                // Base64 "Username:" then "Password:"
                self.send(reader, "334 VXNlcm5hbWU6\r\n").await?;
                let Some(user_line) = self.read_auth_line(reader).await? else {
                    return Ok(());
                };
                self.send(reader, "334 UGFzc3dvcmQ6\r\n").await?;
                let Some(pass_line) = self.read_auth_line(reader).await? else {
                    return Ok(());
                };
                Authenticator::decode_login_field(&user_line)
                    .and_then(|u| Authenticator::decode_login_field(&pass_line).map(|p| (u, p)))
            }
        };

        let (username, password) = match credentials {
            Ok(pair) => pair,
            Err(e) => {
                debug!("bad AUTH payload: {}", e);
                self.error_count += 1;
                self.send(reader, "501 5.5.2 Cannot decode credentials\r\n").await?;
                return Ok(());
            }
        };

        let authenticator = self.authenticator.as_ref().expect("checked above");
        match authenticator.verify(&username, &password).await {
            Ok(principal) => {
                info!("authenticated as {}", principal.username);
                self.principal = Some(principal);
                self.send(reader, "235 2.7.0 Authentication successful\r\n").await?;
            }
            Err(MailError::AuthFailed) => {
                self.error_count += 1;
                self.send(reader, "535 5.7.8 Authentication credentials invalid\r\n")
                    .await?;
            }
            Err(e) => {
                error!("authentication backend error: {}", e);
                self.send(reader, "454 4.7.0 Temporary authentication failure\r\n")
                    .await?;
            }
        }
        Ok(())
    }

    /// One continuation line of an AUTH dialog. `*` cancels (RFC 4954);
    /// `None` means the dialog ended without credentials.
    async fn read_auth_line<R>(&mut self, reader: &mut R) -> Result<Option<String>>
    where
        R: tokio::io::AsyncBufRead + AsyncWrite + Unpin,
    {
        let limits = LineLimits::new(MAX_COMMAND_LINE, self.read_window());
        let Some(line) = read_frame_line(reader, &limits).await? else {
            return Ok(None);
        };
        self.bytes_in += line.len() as u64;
        let text = String::from_utf8_lossy(trim_line_ending(&line)).to_string();
        if text == "*" {
            self.send(reader, "501 5.7.0 Authentication cancelled\r\n").await?;
            return Ok(None);
        }
        Ok(Some(text))
    }

    /// Dot-stuffed payload capture and the commit itself.
    ///
    /// An oversized payload is drained to the terminator so the command
    /// stream stays in sync, then refused; the session falls back to the
    /// post-EHLO state either way.
    async fn receive_data<R>(&mut self, reader: &mut R) -> Result<String>
    where
        R: tokio::io::AsyncBufRead + AsyncWrite + Unpin,
    {
        let mut data: Vec<u8> = Vec::new();
        let mut oversized = false;

        loop {
            let limits = LineLimits::new(MAX_DATA_LINE, self.read_window());
            let line = match read_frame_line(reader, &limits).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return Err(MailError::Protocol(
                        "connection closed during DATA".to_string(),
                    ))
                }
                Err(e) => return Err(e),
            };
            self.bytes_in += line.len() as u64;

            let content = trim_line_ending(&line);
            if content == b"." {
                break;
            }

            if !oversized {
                let unstuffed = dot_unstuff_line(content);
                if data.len() + unstuffed.len() + 2 > self.config.max_message_size {
                    warn!(
                        "DATA exceeds {} bytes, discarding",
                        self.config.max_message_size
                    );
                    oversized = true;
                    data.clear();
                } else {
                    data.extend_from_slice(unstuffed);
                    data.extend_from_slice(b"\r\n");
                }
            }
        }

        // Implicit RSET regardless of outcome; the envelope moves into
        // the commit
        let reverse_path = self.reverse_path.take().unwrap_or_default();
        let forward_paths = std::mem::take(&mut self.forward_paths);
        self.reset_envelope();

        if oversized {
            self.error_count += 1;
            return Ok("552 5.3.4 Message too large\r\n".to_string());
        }
        if data.is_empty() {
            self.error_count += 1;
            return Ok("554 5.6.0 Empty message refused\r\n".to_string());
        }

        match self.commit(reverse_path, forward_paths, data).await {
            Ok(message_id) => Ok(format!("250 2.0.0 OK queued as {}\r\n", message_id)),
            Err(e) => {
                error!("commit failed: {}", e);
                Ok("451 4.3.0 Local error in processing\r\n".to_string())
            }
        }
    }

    /// Persist content then metadata; both or neither survive.
    ///
    /// A resubmission carrying an already-stored message-id is accepted
    /// idempotently when the bytes match and refused otherwise.
    async fn commit(
        &mut self,
        reverse_path: String,
        forward_paths: Vec<String>,
        data: Vec<u8>,
    ) -> Result<String> {
        let headers = MimeParser::parse_headers(&data);
        let message_id = headers
            .get("message-id")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| generate_message_id(&self.domain));

        if let Some(existing) = self.store.get_inbox(&message_id).await? {
            let hint = std::path::Path::new(&existing.content_path);
            let stored = self.content.get(&message_id, Some(hint)).await?;
            if stored == data {
                info!("duplicate submission of {}, accepting", message_id);
                return Ok(message_id);
            }
            return Err(MailError::AlreadyExists(message_id));
        }

        let subject = headers
            .get("subject")
            .map(|s| decode_rfc2047(s))
            .unwrap_or_default();
        let date = headers
            .get("date")
            .and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let content_path = self.content.put(&message_id, &data).await?;

        let record = MailRecord {
            message_id: message_id.clone(),
            from_addr: reverse_path,
            to_addrs: forward_paths,
            subject,
            date,
            size: data.len() as i64,
            is_read: false,
            is_deleted: false,
            is_spam: false,
            spam_score: 0.0,
            content_path: content_path.to_string_lossy().to_string(),
            headers: serde_json::to_string(&headers)
                .map_err(|e| MailError::Storage(e.to_string()))?,
        };

        match self.store.insert_inbox(&record).await {
            Ok(()) => {
                info!(
                    "queued {} ({} bytes) for {:?}",
                    message_id, record.size, record.to_addrs
                );
                Ok(message_id)
            }
            Err(MailError::AlreadyExists(_)) => {
                // Lost a same-id race; the bytes on disk decide
                let stored = self.content.get(&message_id, None).await?;
                if stored == data {
                    Ok(message_id)
                } else {
                    Err(MailError::AlreadyExists(message_id))
                }
            }
            Err(e) => {
                // No metadata row may exist without content, and vice versa
                let _ = self.content.delete(&message_id).await;
                Err(e)
            }
        }
    }

    async fn send<W>(&mut self, w: &mut W, reply: &str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        debug!("S: {}", reply.trim_end());
        w.write_all(reply.as_bytes()).await?;
        w.flush().await?;
        self.bytes_out += reply.len() as u64;
        Ok(())
    }
}
