//! Authentication and TLS
//!
//! Credential verification against Argon2 hashes in the users table, APOP
//! nonce handling, and rustls configuration for both listener and client
//! sides.

pub mod auth;
pub mod tls;

pub use auth::{apop_digest, AuthMechanism, Authenticator, Principal};
pub use tls::TlsSettings;
