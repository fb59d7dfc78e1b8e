//! SMTP: receive-side state machine and send-side client engine
//!
//! RFC 5321 command grammar, RFC 3207 STARTTLS, RFC 4954 AUTH.

pub mod client;
pub mod commands;
pub mod server;
pub mod session;

pub use client::{AuthMethod, SmtpSender, SmtpSenderConfig};
pub use commands::SmtpCommand;
pub use server::SmtpServer;
pub use session::SmtpSession;
