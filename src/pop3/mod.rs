//! POP3: mailbox-service state machine and retrieval client engine
//!
//! RFC 1939 core, RFC 2449 CAPA, RFC 2595 STLS.

pub mod client;
pub mod commands;
pub mod server;
pub mod session;

pub use client::{MessageFilter, Pop3Auth, Pop3Fetcher, Pop3FetcherConfig};
pub use commands::Pop3Command;
pub use server::Pop3Server;
pub use session::Pop3Session;
