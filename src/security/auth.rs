//! Credential verification
//!
//! Passwords are stored as Argon2 PHC strings and verified in constant
//! time. Lookups for unknown usernames burn a verification against a dummy
//! hash so the reply carries no existence signal.

use crate::error::{MailError, Result};
use crate::storage::{MailStore, StoredUser};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use md5::{Digest, Md5};
use rand::Rng;
use std::fmt::Write as _;
use tracing::{debug, info, warn};

/// SASL mechanisms the SMTP server and client speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// PLAIN (RFC 4616): one base64 blob `\0user\0pass`.
    Plain,
    /// LOGIN: two-step base64 username/password prompts.
    Login,
}

impl AuthMechanism {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// The authenticated identity a session acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    /// Mailbox address used to select inbox rows.
    pub email: String,
}

/// Verifies credentials against the users table.
#[derive(Clone)]
pub struct Authenticator {
    store: MailStore,
    /// Hash verified against when the username does not exist.
    decoy_hash: String,
}

impl Authenticator {
    pub fn new(store: MailStore) -> Result<Self> {
        let decoy: u128 = rand::thread_rng().gen();
        let decoy_hash = hash_password(&format!("{:032x}", decoy))?.0;
        Ok(Self { store, decoy_hash })
    }

    /// Provision an account. The Argon2 PHC string embeds its salt; the
    /// separate column mirrors it.
    pub async fn add_user(&self, username: &str, email: &str, password: &str) -> Result<()> {
        let (password_hash, salt) = hash_password(password)?;
        let user = StoredUser {
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            salt,
            is_active: true,
            created_at: Utc::now().to_rfc3339(),
            last_login: None,
        };
        self.store.insert_user(&user).await?;
        info!("user added: {}", username);
        Ok(())
    }

    /// Check a username/password pair.
    ///
    /// The failure path is shaped the same whether the user is missing,
    /// inactive or holds a different password.
    pub async fn verify(&self, username: &str, password: &str) -> Result<Principal> {
        debug!("authentication attempt for {}", username);

        let user = self.store.get_user(username).await?;

        let (hash, active, email) = match &user {
            Some(u) => (u.password_hash.as_str(), u.is_active, u.email.clone()),
            None => (self.decoy_hash.as_str(), false, String::new()),
        };

        let parsed = PasswordHash::new(hash).map_err(|_| MailError::AuthFailed)?;
        let verified = Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok();

        if verified && active {
            self.store.update_last_login(username).await?;
            info!("authentication successful for {}", username);
            Ok(Principal {
                username: username.to_string(),
                email,
            })
        } else {
            warn!("authentication failed for {}", username);
            Err(MailError::AuthFailed)
        }
    }

    /// Fresh APOP greeting token: `<random.timestamp@hostname>`, unique and
    /// unpredictable per connection.
    pub fn issue_apop_nonce(&self, hostname: &str) -> String {
        let nonce: u64 = rand::thread_rng().gen();
        format!("<{:016x}.{}@{}>", nonce, Utc::now().timestamp(), hostname)
    }

    /// APOP verification needs md5-comparable password material. Only
    /// one-way Argon2 hashes are stored, so the mechanism is refused.
    pub async fn verify_apop(
        &self,
        _username: &str,
        _nonce: &str,
        _digest: &str,
    ) -> Result<Principal> {
        Err(MailError::AuthUnsupported("APOP".to_string()))
    }

    /// Decode an AUTH PLAIN blob: base64 of `authzid\0authcid\0password`.
    pub fn decode_plain(blob: &str) -> Result<(String, String)> {
        let decoded = BASE64
            .decode(blob.trim())
            .map_err(|e| MailError::Protocol(format!("invalid base64: {}", e)))?;
        let text = std::str::from_utf8(&decoded)
            .map_err(|e| MailError::Protocol(format!("invalid UTF-8: {}", e)))?;

        let parts: Vec<&str> = text.split('\0').collect();
        if parts.len() != 3 {
            return Err(MailError::Protocol("malformed PLAIN response".to_string()));
        }
        Ok((parts[1].to_string(), parts[2].to_string()))
    }

    /// Decode one base64 line of an AUTH LOGIN exchange.
    pub fn decode_login_field(field: &str) -> Result<String> {
        let decoded = BASE64
            .decode(field.trim())
            .map_err(|e| MailError::Protocol(format!("invalid base64: {}", e)))?;
        String::from_utf8(decoded).map_err(|e| MailError::Protocol(format!("invalid UTF-8: {}", e)))
    }
}

/// Hash a password; returns the PHC string and the salt it embeds.
pub fn hash_password(password: &str) -> Result<(String, String)> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| MailError::Config(format!("password hashing failed: {}", e)))?;
    Ok((hash.to_string(), salt.to_string()))
}

/// The APOP digest: lowercase hex md5 of nonce followed by password
/// (RFC 1939 §7). Used by the POP3 client engine.
pub fn apop_digest(nonce: &str, password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(nonce.as_bytes());
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    digest.iter().fold(String::with_capacity(32), |mut acc, b| {
        let _ = write!(acc, "{:02x}", b);
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn authenticator() -> Authenticator {
        let store = MailStore::open("sqlite::memory:").await.unwrap();
        Authenticator::new(store).unwrap()
    }

    #[tokio::test]
    async fn test_verify_roundtrip() {
        let auth = authenticator().await;
        auth.add_user("alice", "alice@example.com", "s3cret").await.unwrap();

        let principal = auth.verify("alice", "s3cret").await.unwrap();
        assert_eq!(principal.email, "alice@example.com");

        assert!(matches!(
            auth.verify("alice", "wrong").await.unwrap_err(),
            MailError::AuthFailed
        ));
    }

    #[tokio::test]
    async fn test_unknown_user_same_outcome() {
        let auth = authenticator().await;
        let err = auth.verify("ghost", "anything").await.unwrap_err();
        assert!(matches!(err, MailError::AuthFailed));
    }

    #[tokio::test]
    async fn test_inactive_user_denied() {
        let auth = authenticator().await;
        auth.add_user("bob", "bob@example.com", "pw").await.unwrap();
        auth.store.set_user_active("bob", false).await.unwrap();

        assert!(auth.verify("bob", "pw").await.is_err());
    }

    #[tokio::test]
    async fn test_apop_unsupported() {
        let auth = authenticator().await;
        auth.add_user("alice", "alice@example.com", "pw").await.unwrap();
        let err = auth
            .verify_apop("alice", "<x@y>", "0123456789abcdef0123456789abcdef")
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::AuthUnsupported(_)));
    }

    #[tokio::test]
    async fn test_apop_nonce_unique() {
        let auth = authenticator().await;

        let a = auth.issue_apop_nonce("mail.example.com");
        let b = auth.issue_apop_nonce("mail.example.com");
        assert_ne!(a, b);
        assert!(a.starts_with('<') && a.ends_with("@mail.example.com>"));
    }

    #[test]
    fn test_apop_digest_rfc_example() {
        // RFC 1939 §7 worked example
        let digest = apop_digest("<1896.697170952@dbc.mtview.ca.us>", "tanstaaf");
        assert_eq!(digest, "c4c9334bac560ecc979e58001b3e22fb");
    }

    #[test]
    fn test_decode_plain() {
        let blob = BASE64.encode(b"\0alice\0s3cret");
        let (user, pass) = Authenticator::decode_plain(&blob).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "s3cret");

        assert!(Authenticator::decode_plain("not base64!!").is_err());
        let two_fields = BASE64.encode(b"alice\0s3cret");
        assert!(Authenticator::decode_plain(&two_fields).is_err());
    }

    #[test]
    fn test_decode_login_field() {
        let encoded = BASE64.encode(b"alice");
        assert_eq!(Authenticator::decode_login_field(&encoded).unwrap(), "alice");
    }
}
