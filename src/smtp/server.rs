use crate::config::{Config, TlsMode};
use crate::error::Result;
use crate::runtime::{ListenerSettings, MailListener, ShutdownHandle};
use crate::security::{Authenticator, TlsSettings};
use crate::smtp::session::SmtpSession;
use crate::storage::{ContentStore, MailStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// The SMTP receiving server: admission-gated accept loop feeding one
/// [`SmtpSession`] per connection.
pub struct SmtpServer {
    hostname: String,
    domain: String,
    config: crate::config::SmtpConfig,
    store: MailStore,
    content: ContentStore,
    authenticator: Option<Authenticator>,
    tls: Option<TlsSettings>,
}

impl SmtpServer {
    /// Build from the loaded configuration; TLS material is read eagerly
    /// so a bad certificate path fails at startup, not mid-session.
    pub fn new(
        config: &Config,
        store: MailStore,
        content: ContentStore,
        authenticator: Option<Authenticator>,
    ) -> Result<Self> {
        let tls = match config.smtp.tls_mode {
            TlsMode::Plain => None,
            _ => {
                let cert = config.smtp.tls_cert_path.as_deref().unwrap_or_default();
                let key = config.smtp.tls_key_path.as_deref().unwrap_or_default();
                Some(TlsSettings::from_pem_files(cert, key)?)
            }
        };

        Ok(Self {
            hostname: config.server.hostname.clone(),
            domain: config.server.domain.clone(),
            config: config.smtp.clone(),
            store,
            content,
            authenticator,
            tls,
        })
    }

    /// Bind the listener. The returned server is running once `run` is
    /// awaited; `shutdown_handle` stops admission and drains.
    pub async fn bind(self) -> Result<BoundSmtpServer> {
        let settings = ListenerSettings {
            tls_mode: self.config.tls_mode,
            tls: self.tls.clone(),
            max_connections: self.config.max_connections,
            busy_reply: "421 Service not available, too many connections\r\n".to_string(),
            grace_period: Duration::from_secs(self.config.grace_period_secs),
        };
        let (listener, shutdown) = MailListener::bind(&self.config.listen_addr, settings).await?;
        info!("SMTP server on {}", listener.local_addr()?);

        Ok(BoundSmtpServer {
            listener,
            shutdown,
            server: Arc::new(self),
        })
    }
}

pub struct BoundSmtpServer {
    listener: MailListener,
    shutdown: ShutdownHandle,
    server: Arc<SmtpServer>,
}

impl BoundSmtpServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Connections refused at the gate since startup.
    pub fn rejected_connections(&self) -> u64 {
        self.listener.gate().rejected()
    }

    /// Serve until the shutdown handle fires.
    pub async fn run(self) -> Result<()> {
        let server = self.server;
        self.listener
            .run(move |stream, peer, shutdown| {
                let server = server.clone();
                async move {
                    debug!("SMTP session from {}", peer);
                    let session = SmtpSession::new(
                        server.hostname.clone(),
                        server.domain.clone(),
                        server.config.clone(),
                        server.store.clone(),
                        server.content.clone(),
                        server.authenticator.clone(),
                        server.tls.clone(),
                    );
                    session.handle(stream, shutdown).await
                }
            })
            .await
    }
}
