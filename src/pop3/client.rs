//! POP3 retrieval engine
//!
//! Mirror of the server side: connect (implicit TLS or STLS upgrade),
//! authenticate (APOP when the greeting offers a timestamp token,
//! USER/PASS otherwise), then STAT/LIST/UIDL/RETR/DELE over the frozen
//! remote snapshot, finishing with QUIT to commit deletions.

use crate::error::{MailError, Result};
use crate::message::{Message, MimeParser};
use crate::runtime::{dot_unstuff_line, read_frame_line, trim_line_ending, AsyncStream, LineLimits};
use crate::security::auth::apop_digest;
use crate::security::tls::client_connector;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Body lines from arbitrary servers can be long; be lenient on receive.
const MAX_BODY_LINE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop3Auth {
    /// APOP when the greeting carries a timestamp token, else USER/PASS.
    Auto,
    UserPass,
    Apop,
}

#[derive(Debug, Clone)]
pub struct Pop3FetcherConfig {
    pub host: String,
    pub port: u16,
    /// Handshake before any protocol bytes (port 995 style).
    pub implicit_tls: bool,
    /// Attempt an STLS upgrade on plaintext connections.
    pub use_stls: bool,
    /// Trust self-signed server certificates. Off unless asked for.
    pub accept_invalid_certs: bool,
    pub username: String,
    pub password: String,
    pub auth: Pop3Auth,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Pop3FetcherConfig {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            implicit_tls: false,
            use_stls: true,
            accept_invalid_certs: false,
            username: username.to_string(),
            password: password.to_string(),
            auth: Pop3Auth::Auto,
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

/// Client-side filter applied after retrieval.
///
/// `seen_uidls` stands in for a local read-state oracle: POP3 itself has
/// no read flag, so already-fetched messages are recognized by UIDL.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub since: Option<DateTime<Utc>>,
    pub from_contains: Option<String>,
    pub subject_contains: Option<String>,
    pub seen_uidls: Option<HashSet<String>>,
}

impl MessageFilter {
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(since) = self.since {
            if message.date < since {
                return false;
            }
        }
        if let Some(ref needle) = self.from_contains {
            let from = message.from.to_string().to_lowercase();
            if !from.contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if let Some(ref needle) = self.subject_contains {
            if !message
                .subject
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

type Transport = BufReader<Box<dyn AsyncStream>>;

pub struct Pop3Fetcher {
    config: Pop3FetcherConfig,
    transport: Option<Transport>,
    tls_active: bool,
}

impl Pop3Fetcher {
    pub fn new(config: Pop3FetcherConfig) -> Self {
        Self {
            config,
            transport: None,
            tls_active: false,
        }
    }

    /// Connect and authenticate, retrying transient failures with
    /// exponential backoff.
    pub async fn connect(&mut self) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.connect_once().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = Duration::from_secs(1 << attempt);
                    warn!(
                        "POP3 connect attempt {} failed ({}), retrying in {:?}",
                        attempt + 1,
                        e,
                        delay
                    );
                    attempt += 1;
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn connect_once(&mut self) -> Result<()> {
        let window = self.window();
        let addr = format!("{}:{}", self.config.host, self.config.port);
        debug!("connecting to {}", addr);

        let tcp = timeout(
            Duration::from_secs(self.config.timeout_secs),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| MailError::Timeout(format!("connect to {}", addr)))?
        .map_err(|e| MailError::Connect(format!("{}: {}", addr, e)))?;

        let mut transport: Transport = if self.config.implicit_tls {
            let tls = self.handshake(tcp).await?;
            self.tls_active = true;
            BufReader::new(Box::new(tls) as Box<dyn AsyncStream>)
        } else {
            self.tls_active = false;
            BufReader::new(Box::new(tcp) as Box<dyn AsyncStream>)
        };

        let greeting = match read_status(&mut transport, window).await {
            Ok(greeting) => greeting,
            // A busy server turns connections away at the greeting
            Err(MailError::Rejected { text, .. }) => {
                return Err(MailError::ResourceLimit(text));
            }
            Err(e) => return Err(e),
        };
        debug!("greeting: {}", greeting);
        let apop_token = extract_apop_token(&greeting);

        if !self.tls_active && self.config.use_stls {
            write_command(&mut transport, "STLS").await?;
            match read_status(&mut transport, window).await {
                Ok(_) => {
                    let inner = transport.into_inner();
                    let tls = self.handshake(inner).await?;
                    transport = BufReader::new(Box::new(tls) as Box<dyn AsyncStream>);
                    self.tls_active = true;
                    info!("STLS upgrade complete");
                }
                Err(MailError::Rejected { text, .. }) => {
                    debug!("server declined STLS: {}", text);
                }
                Err(e) => return Err(e),
            }
        }

        self.authenticate(&mut transport, apop_token.as_deref()).await?;
        self.transport = Some(transport);
        Ok(())
    }

    async fn handshake(
        &self,
        tcp: impl AsyncRead + AsyncWrite + Unpin + Send + 'static,
    ) -> Result<impl AsyncRead + AsyncWrite + Unpin + Send + 'static> {
        let connector = client_connector(self.config.accept_invalid_certs);
        let server_name = rustls::ServerName::try_from(self.config.host.as_str())
            .map_err(|_| MailError::Tls(format!("invalid host name {}", self.config.host)))?;

        timeout(
            Duration::from_secs(self.config.timeout_secs),
            connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| MailError::Timeout("TLS handshake".to_string()))?
        .map_err(|e| MailError::Tls(format!("handshake failed: {}", e)))
    }

    async fn authenticate(
        &mut self,
        transport: &mut Transport,
        apop_token: Option<&str>,
    ) -> Result<()> {
        let window = self.window();
        let try_apop = match self.config.auth {
            Pop3Auth::Apop => true,
            Pop3Auth::Auto => apop_token.is_some(),
            Pop3Auth::UserPass => false,
        };

        if try_apop {
            let token = apop_token.ok_or_else(|| {
                MailError::AuthUnsupported("APOP (no greeting token)".to_string())
            })?;
            let digest = apop_digest(token, &self.config.password);
            write_command(
                transport,
                &format!("APOP {} {}", self.config.username, digest),
            )
            .await?;
            match read_status(transport, window).await {
                Ok(_) => {
                    info!("authenticated via APOP as {}", self.config.username);
                    return Ok(());
                }
                Err(e) if self.config.auth == Pop3Auth::Apop => {
                    return Err(auth_error(e));
                }
                Err(e) => {
                    debug!("APOP refused ({}), falling back to USER/PASS", e);
                }
            }
        }

        write_command(transport, &format!("USER {}", self.config.username))
            .await?;
        read_status(transport, window).await.map_err(auth_error)?;
        write_command(transport, &format!("PASS {}", self.config.password))
            .await?;
        read_status(transport, window).await.map_err(auth_error)?;

        info!("authenticated as {}", self.config.username);
        Ok(())
    }

    /// STAT: message count and total octets.
    pub async fn status(&mut self) -> Result<(usize, u64)> {
        let window = self.window();
        let transport = self.transport.as_mut().ok_or_else(not_connected)?;
        write_command(transport, "STAT").await?;
        let status = read_status(transport, window).await?;
        parse_stat(&status)
    }

    /// LIST: `(number, size)` for every live message.
    pub async fn list(&mut self) -> Result<Vec<(usize, u64)>> {
        let lines = self.multiline_command("LIST").await?;
        lines
            .iter()
            .map(|line| {
                let text = String::from_utf8_lossy(line);
                let mut parts = text.split_whitespace();
                let n = parts.next().and_then(|p| p.parse().ok());
                let size = parts.next().and_then(|p| p.parse().ok());
                match (n, size) {
                    (Some(n), Some(size)) => Ok((n, size)),
                    _ => Err(MailError::Protocol(format!("bad LIST line: {}", text))),
                }
            })
            .collect()
    }

    /// UIDL: `(number, unique id)` for every live message.
    pub async fn uidl(&mut self) -> Result<Vec<(usize, String)>> {
        let lines = self.multiline_command("UIDL").await?;
        lines
            .iter()
            .map(|line| {
                let text = String::from_utf8_lossy(line);
                let mut parts = text.split_whitespace();
                let n = parts.next().and_then(|p| p.parse().ok());
                let uidl = parts.next().map(|p| p.to_string());
                match (n, uidl) {
                    (Some(n), Some(uidl)) => Ok((n, uidl)),
                    _ => Err(MailError::Protocol(format!("bad UIDL line: {}", text))),
                }
            })
            .collect()
    }

    /// RETR: the exact stored bytes, dot-unstuffed, CRLF preserved.
    pub async fn retrieve_raw(&mut self, n: usize) -> Result<Vec<u8>> {
        let lines = self.multiline_command(&format!("RETR {}", n)).await?;
        let mut bytes = Vec::new();
        for line in &lines {
            bytes.extend_from_slice(line);
            bytes.extend_from_slice(b"\r\n");
        }
        Ok(bytes)
    }

    /// RETR plus parse; optionally DELE afterwards.
    pub async fn retrieve(&mut self, n: usize, delete: bool) -> Result<Message> {
        let bytes = self.retrieve_raw(n).await?;
        let message = MimeParser::parse(&bytes)?;
        if delete {
            self.delete(n).await?;
        }
        Ok(message)
    }

    /// Fetch every message passing the filter; `delete` removes the ones
    /// that were kept.
    pub async fn retrieve_all(
        &mut self,
        filter: &MessageFilter,
        delete: bool,
    ) -> Result<Vec<Message>> {
        let listing = self.list().await?;

        // Correlate numbers with UIDLs only when the oracle needs them
        let uidls = if filter.seen_uidls.is_some() {
            self.uidl().await?.into_iter().collect()
        } else {
            std::collections::HashMap::new()
        };

        let mut messages = Vec::new();
        for (n, _size) in listing {
            if let (Some(seen), Some(uidl)) = (&filter.seen_uidls, uidls.get(&n)) {
                if seen.contains(uidl) {
                    continue;
                }
            }

            let message = self.retrieve(n, false).await?;
            if !filter.matches(&message) {
                continue;
            }
            if delete {
                self.delete(n).await?;
            }
            messages.push(message);
        }

        info!("retrieved {} message(s)", messages.len());
        Ok(messages)
    }

    pub async fn delete(&mut self, n: usize) -> Result<()> {
        let window = self.window();
        let transport = self.transport.as_mut().ok_or_else(not_connected)?;
        write_command(transport, &format!("DELE {}", n)).await?;
        read_status(transport, window).await.map(|_| ())
    }

    pub async fn reset(&mut self) -> Result<()> {
        let window = self.window();
        let transport = self.transport.as_mut().ok_or_else(not_connected)?;
        write_command(transport, "RSET").await?;
        read_status(transport, window).await.map(|_| ())
    }

    /// QUIT: asks the server to enter UPDATE and commit deletions.
    pub async fn quit(&mut self) -> Result<()> {
        let window = self.window();
        let Some(mut transport) = self.transport.take() else {
            return Ok(());
        };
        write_command(&mut transport, "QUIT").await?;
        let status = read_status(&mut transport, window).await?;
        debug!("server signed off: {}", status);
        Ok(())
    }

    async fn multiline_command(&mut self, command: &str) -> Result<Vec<Vec<u8>>> {
        let window = self.window();
        let transport = self.transport.as_mut().ok_or_else(not_connected)?;
        write_command(transport, command).await?;
        read_status(transport, window).await?;
        read_multiline(transport, window).await
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }
}

async fn write_command(transport: &mut Transport, command: &str) -> Result<()> {
    if command.starts_with("PASS") {
        debug!("C: PASS [hidden]");
    } else {
        debug!("C: {}", command);
    }
    transport.write_all(command.as_bytes()).await?;
    transport.write_all(b"\r\n").await?;
    transport.flush().await?;
    Ok(())
}

/// One status line; `+OK` yields its text, `-ERR` becomes an error.
async fn read_status(transport: &mut Transport, window: Duration) -> Result<String> {
    let limits = LineLimits::new(MAX_BODY_LINE, window);
    let Some(line) = read_frame_line(transport, &limits).await? else {
        return Err(MailError::Protocol("connection closed".to_string()));
    };
    let text = String::from_utf8_lossy(trim_line_ending(&line)).to_string();
    debug!("S: {}", text);

    if let Some(rest) = text.strip_prefix("+OK") {
        Ok(rest.trim().to_string())
    } else if let Some(rest) = text.strip_prefix("-ERR") {
        Err(MailError::Rejected {
            code: 0,
            enhanced: None,
            text: rest.trim().to_string(),
        })
    } else {
        Err(MailError::Protocol(format!("malformed status line: {}", text)))
    }
}

/// Lines until the lone-dot terminator, unstuffed, CRLF stripped.
async fn read_multiline(transport: &mut Transport, window: Duration) -> Result<Vec<Vec<u8>>> {
    let limits = LineLimits::new(MAX_BODY_LINE, window);
    let mut lines = Vec::new();

    loop {
        let Some(line) = read_frame_line(transport, &limits).await? else {
            return Err(MailError::Protocol(
                "connection closed inside multiline reply".to_string(),
            ));
        };
        let content = trim_line_ending(&line);
        if content == b"." {
            return Ok(lines);
        }
        lines.push(dot_unstuff_line(content).to_vec());
    }
}

fn not_connected() -> MailError {
    MailError::Protocol("not connected".to_string())
}

fn auth_error(e: MailError) -> MailError {
    match e {
        MailError::Rejected { .. } => MailError::AuthFailed,
        other => other,
    }
}

/// The `<...>` token in an APOP-capable greeting.
fn extract_apop_token(greeting: &str) -> Option<String> {
    let start = greeting.find('<')?;
    let end = greeting[start..].find('>')? + start;
    let token = &greeting[start..=end];
    if token.contains('@') {
        Some(token.to_string())
    } else {
        None
    }
}

fn parse_stat(status: &str) -> Result<(usize, u64)> {
    let mut parts = status.split_whitespace();
    let count = parts.next().and_then(|p| p.parse().ok());
    let size = parts.next().and_then(|p| p.parse().ok());
    match (count, size) {
        (Some(count), Some(size)) => Ok((count, size)),
        _ => Err(MailError::Protocol(format!("bad STAT reply: {}", status))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Address;

    #[test]
    fn test_extract_apop_token() {
        assert_eq!(
            extract_apop_token("POP3 server ready <123.456@host>").as_deref(),
            Some("<123.456@host>")
        );
        assert!(extract_apop_token("POP3 server ready").is_none());
        // Angle brackets without an @ are not a timestamp token
        assert!(extract_apop_token("ready <notatoken>").is_none());
    }

    #[test]
    fn test_parse_stat() {
        assert_eq!(parse_stat("2 320").unwrap(), (2, 320));
        assert!(parse_stat("garbage").is_err());
    }

    #[test]
    fn test_filter_matching() {
        let mut message = Message::new(
            Address::parse("Alice <alice@example.com>").unwrap(),
            vec![Address::parse("bob@example.com").unwrap()],
            "Weekly report",
        );
        message.date = Utc::now();

        let pass = MessageFilter {
            from_contains: Some("alice".to_string()),
            subject_contains: Some("report".to_string()),
            ..Default::default()
        };
        assert!(pass.matches(&message));

        let wrong_sender = MessageFilter {
            from_contains: Some("mallory".to_string()),
            ..Default::default()
        };
        assert!(!wrong_sender.matches(&message));

        let too_recent = MessageFilter {
            since: Some(Utc::now() + chrono::Duration::hours(1)),
            ..Default::default()
        };
        assert!(!too_recent.matches(&message));
    }
}
