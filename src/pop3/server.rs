use crate::config::{Config, TlsMode};
use crate::error::Result;
use crate::pop3::session::Pop3Session;
use crate::runtime::{ListenerSettings, MailListener, ShutdownHandle};
use crate::security::{Authenticator, TlsSettings};
use crate::storage::{ContentStore, MailStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// The POP3 mailbox server: admission-gated accept loop feeding one
/// [`Pop3Session`] per connection.
pub struct Pop3Server {
    hostname: String,
    config: crate::config::Pop3Config,
    store: MailStore,
    content: ContentStore,
    authenticator: Authenticator,
    tls: Option<TlsSettings>,
}

impl Pop3Server {
    pub fn new(
        config: &Config,
        store: MailStore,
        content: ContentStore,
        authenticator: Authenticator,
    ) -> Result<Self> {
        let tls = match config.pop3.tls_mode {
            TlsMode::Plain => None,
            _ => {
                let cert = config.pop3.tls_cert_path.as_deref().unwrap_or_default();
                let key = config.pop3.tls_key_path.as_deref().unwrap_or_default();
                Some(TlsSettings::from_pem_files(cert, key)?)
            }
        };

        Ok(Self {
            hostname: config.server.hostname.clone(),
            config: config.pop3.clone(),
            store,
            content,
            authenticator,
            tls,
        })
    }

    pub async fn bind(self) -> Result<BoundPop3Server> {
        let settings = ListenerSettings {
            tls_mode: self.config.tls_mode,
            tls: self.tls.clone(),
            max_connections: self.config.max_connections,
            busy_reply: "-ERR server busy, try again later\r\n".to_string(),
            grace_period: Duration::from_secs(self.config.grace_period_secs),
        };
        let (listener, shutdown) = MailListener::bind(&self.config.listen_addr, settings).await?;
        info!("POP3 server on {}", listener.local_addr()?);

        Ok(BoundPop3Server {
            listener,
            shutdown,
            server: Arc::new(self),
        })
    }
}

pub struct BoundPop3Server {
    listener: MailListener,
    shutdown: ShutdownHandle,
    server: Arc<Pop3Server>,
}

impl BoundPop3Server {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn rejected_connections(&self) -> u64 {
        self.listener.gate().rejected()
    }

    pub async fn run(self) -> Result<()> {
        let server = self.server;
        self.listener
            .run(move |stream, peer, shutdown| {
                let server = server.clone();
                async move {
                    debug!("POP3 session from {}", peer);
                    let session = Pop3Session::new(
                        server.hostname.clone(),
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
