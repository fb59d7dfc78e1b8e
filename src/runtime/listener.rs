//! Accept loop with admission gating and cooperative shutdown
//!
//! Implicit-TLS handshakes complete before the session sees the stream;
//! a handshake failure closes the socket without a banner. When the gate
//! is full the busy line is written to the raw socket and the connection
//! closed before any handshake work.

use crate::config::TlsMode;
use crate::error::{MailError, Result};
use crate::runtime::gate::ConnectionGate;
use crate::runtime::stream::MailStream;
use crate::security::TlsSettings;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How a listener behaves; built by each server from its config section.
#[derive(Clone)]
pub struct ListenerSettings {
    pub tls_mode: TlsMode,
    pub tls: Option<TlsSettings>,
    pub max_connections: usize,
    /// Protocol-appropriate busy line, written when the gate is full.
    pub busy_reply: String,
    pub grace_period: Duration,
}

/// Signals the accept loop to stop admitting and begin draining.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct MailListener {
    listener: TcpListener,
    settings: ListenerSettings,
    gate: ConnectionGate,
    shutdown_rx: watch::Receiver<bool>,
}

impl MailListener {
    pub async fn bind(addr: &str, settings: ListenerSettings) -> Result<(Self, ShutdownHandle)> {
        if settings.tls_mode != TlsMode::Plain && settings.tls.is_none() {
            return Err(MailError::Config(format!(
                "{:?} listener on {} has no TLS material",
                settings.tls_mode, addr
            )));
        }

        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", listener.local_addr()?);

        let (tx, rx) = watch::channel(false);
        let gate = ConnectionGate::new(settings.max_connections);
        Ok((
            Self {
                listener,
                settings,
                gate,
                shutdown_rx: rx,
            },
            ShutdownHandle {
                tx: std::sync::Arc::new(tx),
            },
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn gate(&self) -> &ConnectionGate {
        &self.gate
    }

    /// Accept until shutdown, spawning one task per admitted connection.
    ///
    /// The handler receives the (possibly already TLS) stream, the peer
    /// address and a shutdown receiver it checks between commands. After
    /// shutdown, live sessions get the grace period to finish before their
    /// tasks are aborted.
    pub async fn run<H, Fut>(mut self, handler: H) -> Result<()>
    where
        H: Fn(MailStream<TcpStream>, SocketAddr, watch::Receiver<bool>) -> Fut
            + Clone
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut sessions: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => break,

                accepted = self.listener.accept() => {
                    let (mut socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("accept failed: {}", e);
                            continue;
                        }
                    };

                    let Some(permit) = self.gate.try_admit() else {
                        debug!("gate full, refusing {}", peer);
                        let busy = self.settings.busy_reply.clone();
                        tokio::spawn(async move {
                            let _ = timeout(Duration::from_secs(5), async {
                                let _ = socket.write_all(busy.as_bytes()).await;
                                let _ = socket.shutdown().await;
                            })
                            .await;
                        });
                        continue;
                    };

                    debug!("connection from {} ({} active)", peer, self.gate.active());
                    let handler = handler.clone();
                    let tls_mode = self.settings.tls_mode;
                    let acceptor = self.settings.tls.as_ref().map(|t| t.acceptor());
                    let shutdown_rx = self.shutdown_rx.clone();

                    sessions.spawn(async move {
                        let _permit = permit;

                        let stream = if tls_mode == TlsMode::Implicit {
                            let acceptor = acceptor.expect("checked at bind");
                            match acceptor.accept(socket).await {
                                Ok(tls) => MailStream::Tls(Box::new(tls)),
                                Err(e) => {
                                    // No banner was sent; just drop the socket
                                    debug!("TLS handshake from {} failed: {}", peer, e);
                                    return;
                                }
                            }
                        } else {
                            MailStream::Plain(socket)
                        };

                        if let Err(e) = handler(stream, peer, shutdown_rx).await {
                            warn!("session from {} ended with error: {}", peer, e);
                        }
                    });
                }

                // Reap finished sessions so the set stays small
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        info!(
            "listener stopping, draining {} active session(s)",
            sessions.len()
        );
        let drain = async {
            while sessions.join_next().await.is_some() {}
        };
        if timeout(self.settings.grace_period, drain).await.is_err() {
            warn!("grace period expired, aborting remaining sessions");
        }
        // Abort is a no-op for sessions that already finished
        sessions.shutdown().await;

        Ok(())
    }
}
