//! SMTP send-side engine
//!
//! Drives a full submission: connect (implicit TLS or STARTTLS upgrade),
//! EHLO, AUTH, envelope, dot-stuffed DATA, QUIT. Transient failures
//! (connect errors, TLS handshake, 4xx replies) retry with exponential
//! backoff; permanent 5xx rejections do not.

use crate::error::{MailError, Result};
use crate::message::{Message, MessageBuilder, MimeParser};
use crate::message::mime::decode_rfc2047;
use crate::runtime::{dot_stuff, AsyncStream};
use crate::security::tls::client_connector;
use crate::storage::{ContentStore, MailRecord, MailStore};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Mechanism selection for the submission dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Try PLAIN, fall back to LOGIN.
    Auto,
    Plain,
    Login,
}

#[derive(Debug, Clone)]
pub struct SmtpSenderConfig {
    pub host: String,
    pub port: u16,
    /// Handshake before any protocol bytes (port 465 style).
    pub implicit_tls: bool,
    /// Upgrade via STARTTLS when the server offers it.
    pub use_starttls: bool,
    /// Trust self-signed server certificates. Off unless asked for.
    pub accept_invalid_certs: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth_method: AuthMethod,
    /// Domain announced in EHLO; the local hostname when unset.
    pub ehlo_domain: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl SmtpSenderConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            implicit_tls: false,
            use_starttls: true,
            accept_invalid_certs: false,
            username: None,
            password: None,
            auth_method: AuthMethod::Auto,
            ehlo_domain: None,
            timeout_secs: 30,
            max_retries: 3,
        }
    }

    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }
}

/// One fully parsed server reply.
#[derive(Debug, Clone)]
struct SmtpReply {
    code: u16,
    enhanced: Option<String>,
    text: String,
    lines: Vec<String>,
}

impl SmtpReply {
    fn is_positive(&self) -> bool {
        (200..400).contains(&self.code)
    }

    fn into_rejection(self) -> MailError {
        MailError::Rejected {
            code: self.code,
            enhanced: self.enhanced,
            text: self.text,
        }
    }
}

type Transport = BufReader<Box<dyn AsyncStream>>;

pub struct SmtpSender {
    config: SmtpSenderConfig,
    sent_copy: Option<(MailStore, ContentStore)>,
}

impl SmtpSender {
    pub fn new(config: SmtpSenderConfig) -> Self {
        Self {
            config,
            sent_copy: None,
        }
    }

    /// Record a sent-table row and content file after each success.
    pub fn with_sent_copy(mut self, store: MailStore, content: ContentStore) -> Self {
        self.sent_copy = Some((store, content));
        self
    }

    /// Frame and submit a structured message.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let data = MessageBuilder::build(message)?;
        let recipients: Vec<String> =
            message.recipients().iter().map(|a| a.email()).collect();
        self.send_raw(&message.from.email(), &recipients, &data).await
    }

    /// Submit already-framed message bytes.
    pub async fn send_raw(&self, from: &str, recipients: &[String], data: &[u8]) -> Result<()> {
        if recipients.is_empty() {
            return Err(MailError::Protocol("no recipients".to_string()));
        }

        let mut attempt = 0;
        loop {
            match self.submit_once(from, recipients, data).await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = Duration::from_secs(1 << attempt);
                    warn!(
                        "submission attempt {} failed ({}), retrying in {:?}",
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

        if let Some((store, content)) = &self.sent_copy {
            self.save_sent_copy(store, content, from, recipients, data)
                .await?;
        }
        Ok(())
    }

    async fn submit_once(&self, from: &str, recipients: &[String], data: &[u8]) -> Result<()> {
        let (mut transport, mut tls_active) = self.connect().await?;

        let greeting = self.read_reply(&mut transport).await?;
        if greeting.code != 220 {
            return Err(greeting.into_rejection());
        }

        let ehlo_domain = self
            .config
            .ehlo_domain
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().to_string());

        let mut capabilities = self.ehlo(&mut transport, &ehlo_domain).await?;

        if !tls_active
            && self.config.use_starttls
            && capabilities.iter().any(|c| c == "STARTTLS")
        {
            self.command(&mut transport, "STARTTLS").await?;
            let reply = self.read_reply(&mut transport).await?;
            if reply.code != 220 {
                return Err(reply.into_rejection());
            }

            transport = self.upgrade(transport).await?;
            tls_active = true;
            // Capabilities must be re-learned on the secured channel
            capabilities = self.ehlo(&mut transport, &ehlo_domain).await?;
        }

        if let (Some(username), Some(password)) =
            (&self.config.username, &self.config.password)
        {
            self.authenticate(&mut transport, &capabilities, username, password)
                .await?;
        }

        self.command(&mut transport, &format!("MAIL FROM:<{}>", from))
            .await?;
        let reply = self.read_reply(&mut transport).await?;
        if !reply.is_positive() {
            return Err(reply.into_rejection());
        }

        let mut accepted = 0usize;
        let mut last_rejection: Option<SmtpReply> = None;
        for recipient in recipients {
            self.command(&mut transport, &format!("RCPT TO:<{}>", recipient))
                .await?;
            let reply = self.read_reply(&mut transport).await?;
            if reply.is_positive() {
                accepted += 1;
            } else {
                warn!("recipient {} refused: {} {}", recipient, reply.code, reply.text);
                last_rejection = Some(reply);
            }
        }
        if accepted == 0 {
            // All recipients refused; the worst class drives retry behavior
            return Err(last_rejection
                .map(SmtpReply::into_rejection)
                .unwrap_or_else(|| MailError::Protocol("no recipients accepted".to_string())));
        }

        self.command(&mut transport, "DATA").await?;
        let reply = self.read_reply(&mut transport).await?;
        if reply.code != 354 {
            return Err(reply.into_rejection());
        }

        let mut framed = dot_stuff(data);
        framed.extend_from_slice(b".\r\n");
        transport.write_all(&framed).await?;
        transport.flush().await?;

        let reply = self.read_reply(&mut transport).await?;
        if !reply.is_positive() {
            return Err(reply.into_rejection());
        }
        info!("message accepted: {}", reply.text);

        self.command(&mut transport, "QUIT").await?;
        // The 221 is a courtesy; the commit already happened
        let _ = self.read_reply(&mut transport).await;
        Ok(())
    }

    async fn connect(&self) -> Result<(Transport, bool)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        debug!("connecting to {}", addr);

        let tcp = timeout(
            Duration::from_secs(self.config.timeout_secs),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| MailError::Timeout(format!("connect to {}", addr)))?
        .map_err(|e| MailError::Connect(format!("{}: {}", addr, e)))?;

        if self.config.implicit_tls {
            let stream = self.handshake(tcp).await?;
            Ok((BufReader::new(Box::new(stream) as Box<dyn AsyncStream>), true))
        } else {
            Ok((BufReader::new(Box::new(tcp) as Box<dyn AsyncStream>), false))
        }
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

    async fn upgrade(&self, transport: Transport) -> Result<Transport> {
        // Nothing may be buffered: STARTTLS was just acknowledged
        let inner = transport.into_inner();
        let tls = self.handshake(inner).await?;
        Ok(BufReader::new(Box::new(tls) as Box<dyn AsyncStream>))
    }

    async fn ehlo(&self, transport: &mut Transport, domain: &str) -> Result<Vec<String>> {
        self.command(transport, &format!("EHLO {}", domain)).await?;
        let reply = self.read_reply(transport).await?;
        if !reply.is_positive() {
            return Err(reply.into_rejection());
        }

        // First line is the server greeting; the rest are capabilities
        Ok(reply
            .lines
            .iter()
            .skip(1)
            .map(|l| l.trim().to_uppercase())
            .collect())
    }

    async fn authenticate(
        &self,
        transport: &mut Transport,
        capabilities: &[String],
        username: &str,
        password: &str,
    ) -> Result<()> {
        let advertised: Vec<&str> = capabilities
            .iter()
            .find(|c| c.starts_with("AUTH "))
            .map(|c| c.split_whitespace().skip(1).collect())
            .unwrap_or_default();

        let offered = |name: &str| advertised.is_empty() || advertised.contains(&name);

        match self.config.auth_method {
            AuthMethod::Plain => self.auth_plain(transport, username, password).await,
            AuthMethod::Login => self.auth_login(transport, username, password).await,
            AuthMethod::Auto => {
                if offered("PLAIN") {
                    match self.auth_plain(transport, username, password).await {
                        Ok(()) => return Ok(()),
                        Err(MailError::AuthFailed) if offered("LOGIN") => {
                            debug!("PLAIN refused, falling back to LOGIN");
                        }
                        Err(e) => return Err(e),
                    }
                }
                self.auth_login(transport, username, password).await
            }
        }
    }

    async fn auth_plain(
        &self,
        transport: &mut Transport,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let blob = BASE64.encode(format!("\0{}\0{}", username, password).as_bytes());
        self.command(transport, &format!("AUTH PLAIN {}", blob)).await?;
        self.expect_auth_success(transport).await
    }

    async fn auth_login(
        &self,
        transport: &mut Transport,
        username: &str,
        password: &str,
    ) -> Result<()> {
        self.command(transport, "AUTH LOGIN").await?;
        let reply = self.read_reply(transport).await?;
        if reply.code != 334 {
            return Err(reply.into_rejection());
        }
        self.command(transport, &BASE64.encode(username.as_bytes()))
            .await?;
        let reply = self.read_reply(transport).await?;
        if reply.code != 334 {
            return Err(reply.into_rejection());
        }
        self.command(transport, &BASE64.encode(password.as_bytes()))
            .await?;
        self.expect_auth_success(transport).await
    }

    async fn expect_auth_success(&self, transport: &mut Transport) -> Result<()> {
        let reply = self.read_reply(transport).await?;
        match reply.code {
            235 => {
                info!("authenticated as {:?}", self.config.username);
                Ok(())
            }
            535 | 538 => Err(MailError::AuthFailed),
            _ => Err(reply.into_rejection()),
        }
    }

    async fn command(&self, transport: &mut Transport, line: &str) -> Result<()> {
        debug!("C: {}", line);
        transport.write_all(line.as_bytes()).await?;
        transport.write_all(b"\r\n").await?;
        transport.flush().await?;
        Ok(())
    }

    async fn read_reply(&self, transport: &mut Transport) -> Result<SmtpReply> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();
            let n = timeout(
                Duration::from_secs(self.config.timeout_secs),
                transport.read_line(&mut line),
            )
            .await
            .map_err(|_| MailError::Timeout("waiting for reply".to_string()))??;
            if n == 0 {
                return Err(MailError::Protocol(
                    "connection closed mid-reply".to_string(),
                ));
            }

            debug!("S: {}", line.trim_end());
            let done = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line.trim_end().to_string());
            if done {
                break;
            }
        }

        let last = lines.last().expect("at least one line");
        let code: u16 = last
            .get(..3)
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| MailError::Protocol(format!("malformed reply: {}", last)))?;

        let rest = last
            .get(3..)
            .unwrap_or("")
            .trim_start_matches([' ', '-'])
            .to_string();
        let (enhanced, text) = split_enhanced_code(&rest);

        Ok(SmtpReply {
            code,
            enhanced,
            text,
            lines: lines
                .iter()
                .map(|l| l.get(4..).unwrap_or("").to_string())
                .collect(),
        })
    }

    async fn save_sent_copy(
        &self,
        store: &MailStore,
        content: &ContentStore,
        from: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<()> {
        let headers = MimeParser::parse_headers(data);
        let message_id = headers
            .get("message-id")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| crate::message::generate_message_id(&self.config.host));

        let path = content.put(&message_id, data).await?;
        let record = MailRecord {
            message_id: message_id.clone(),
            from_addr: from.to_string(),
            to_addrs: recipients.to_vec(),
            subject: headers
                .get("subject")
                .map(|s| decode_rfc2047(s))
                .unwrap_or_default(),
            date: headers
                .get("date")
                .and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
            size: data.len() as i64,
            is_read: true,
            is_deleted: false,
            is_spam: false,
            spam_score: 0.0,
            content_path: path.to_string_lossy().to_string(),
            headers: serde_json::to_string(&headers)
                .map_err(|e| MailError::Storage(e.to_string()))?,
        };

        match store.insert_sent(&record).await {
            Ok(()) => {
                debug!("sent copy stored as {}", message_id);
                Ok(())
            }
            // A retried submission may have saved its copy already
            Err(MailError::AlreadyExists(_)) => Ok(()),
            Err(e) => {
                let _ = content.delete(&message_id).await;
                Err(e)
            }
        }
    }
}

/// Split `"5.1.1 mailbox unavailable"` into the enhanced code and text.
fn split_enhanced_code(rest: &str) -> (Option<String>, String) {
    let mut parts = rest.splitn(2, ' ');
    let first = parts.next().unwrap_or("");
    let is_enhanced = {
        let fields: Vec<&str> = first.split('.').collect();
        fields.len() == 3 && fields.iter().all(|f| f.chars().all(|c| c.is_ascii_digit()))
    };
    if is_enhanced {
        (
            Some(first.to_string()),
            parts.next().unwrap_or("").to_string(),
        )
    } else {
        (None, rest.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_enhanced_code() {
        let (enhanced, text) = split_enhanced_code("5.1.1 mailbox unavailable");
        assert_eq!(enhanced.as_deref(), Some("5.1.1"));
        assert_eq!(text, "mailbox unavailable");

        let (enhanced, text) = split_enhanced_code("Service ready");
        assert!(enhanced.is_none());
        assert_eq!(text, "Service ready");
    }

    #[test]
    fn test_config_builder() {
        let config = SmtpSenderConfig::new("mail.example.com", 587)
            .credentials("alice", "pw");
        assert_eq!(config.port, 587);
        assert_eq!(config.username.as_deref(), Some("alice"));
        assert_eq!(config.auth_method, AuthMethod::Auto);
        assert!(config.use_starttls);
        assert!(!config.accept_invalid_certs);
    }
}
