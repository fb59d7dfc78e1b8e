//! postbox: an end-to-end SMTP/POP3 mail platform
//!
//! The crate houses both sides of both wire protocols plus the storage
//! they commit to:
//!
//! - **SMTP server**: receive-side state machine (RFC 5321), STARTTLS
//!   (RFC 3207), AUTH PLAIN/LOGIN (RFC 4954), exactly-once durable commit
//!   of received messages.
//! - **POP3 server**: mailbox service (RFC 1939) with CAPA (RFC 2449) and
//!   STLS (RFC 2595), per-session frozen mailbox snapshots.
//! - **Client engines**: symmetric SMTP submission and POP3 retrieval
//!   drivers with retry/backoff and TLS.
//! - **Storage**: one `.eml` file per message written atomically, plus
//!   SQLite metadata (inbox, sent, users) under a WAL journal.
//!
//! # Example
//!
//! ```no_run
//! use postbox::config::Config;
//! use postbox::security::Authenticator;
//! use postbox::smtp::SmtpServer;
//! use postbox::storage::{ContentStore, MailStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let store = MailStore::open(&config.storage.database_url).await?;
//!     let content = ContentStore::new(config.storage.emails_dir.clone());
//!     let auth = Authenticator::new(store.clone())?;
//!
//!     let smtp = SmtpServer::new(&config, store, content, Some(auth))?;
//!     smtp.bind().await?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod pop3;
pub mod runtime;
pub mod security;
pub mod smtp;
pub mod storage;

pub use config::Config;
pub use error::{MailError, Result};
