use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("authentication mechanism {0} not supported")]
    AuthUnsupported(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// Rejection from the remote server, carrying the reply code and
    /// optional RFC 3463 enhanced code.
    #[error("server rejected command: {code} {text}")]
    Rejected {
        code: u16,
        enhanced: Option<String>,
        text: String,
    },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("message already stored: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl MailError {
    /// Whether a retry may succeed (4xx replies, busy signals, timeouts,
    /// transport hiccups).
    pub fn is_transient(&self) -> bool {
        match self {
            MailError::Rejected { code, .. } => (400..500).contains(code),
            MailError::Io(_)
            | MailError::Timeout(_)
            | MailError::Connect(_)
            | MailError::ResourceLimit(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MailError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let transient = MailError::Rejected {
            code: 451,
            enhanced: Some("4.3.0".to_string()),
            text: "try again".to_string(),
        };
        assert!(transient.is_transient());

        let permanent = MailError::Rejected {
            code: 550,
            enhanced: None,
            text: "no such user".to_string(),
        };
        assert!(!permanent.is_transient());

        assert!(!MailError::AuthFailed.is_transient());
    }
}
