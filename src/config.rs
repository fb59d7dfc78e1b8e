use crate::error::{MailError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How a listener speaks TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Plaintext only.
    Plain,
    /// TLS handshake before any protocol bytes (ports 465/995 style).
    Implicit,
    /// Plaintext greeting, STARTTLS/STLS upgrade offered.
    StartTls,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpConfig,
    pub pop3: Pop3Config,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub domain: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmtpConfig {
    pub listen_addr: String,
    pub tls_mode: TlsMode,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    /// Refuse MAIL FROM until the session has authenticated.
    pub require_auth: bool,
    /// Refuse AUTH on plaintext connections.
    pub auth_requires_tls: bool,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
    pub session_timeout_secs: u64,
    pub grace_period_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Pop3Config {
    pub listen_addr: String,
    pub tls_mode: TlsMode,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
    pub session_timeout_secs: u64,
    pub grace_period_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub database_url: String,
    /// Directory holding one `.eml` file per stored message.
    pub emails_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| MailError::Config(e.to_string()))?;

        toml::from_str(&content).map_err(|e| MailError::Config(e.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                domain: "localhost".to_string(),
                hostname: "mail.localhost".to_string(),
            },
            smtp: SmtpConfig {
                listen_addr: "0.0.0.0:2525".to_string(),
                tls_mode: TlsMode::Plain,
                tls_cert_path: None,
                tls_key_path: None,
                require_auth: false,
                auth_requires_tls: false,
                max_message_size: 10 * 1024 * 1024, // 10MB
                max_recipients: 100,
                max_connections: 200,
                idle_timeout_secs: 300,
                session_timeout_secs: 1800,
                grace_period_secs: 10,
            },
            pop3: Pop3Config {
                listen_addr: "0.0.0.0:1110".to_string(),
                tls_mode: TlsMode::Plain,
                tls_cert_path: None,
                tls_key_path: None,
                max_connections: 200,
                idle_timeout_secs: 600,
                session_timeout_secs: 1800,
                grace_period_secs: 10,
            },
            storage: StorageConfig {
                database_url: "sqlite://mail.db".to_string(),
                emails_dir: "data/emails".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.domain, "localhost");
        assert_eq!(config.smtp.tls_mode, TlsMode::Plain);
        assert_eq!(config.smtp.max_message_size, 10 * 1024 * 1024);
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.pop3.listen_addr, config.pop3.listen_addr);
        assert_eq!(parsed.smtp.tls_mode, TlsMode::Plain);
    }

    #[test]
    fn test_tls_mode_names() {
        let parsed: TlsMode = toml::from_str::<toml::Value>("mode = \"start_tls\"")
            .unwrap()
            .get("mode")
            .unwrap()
            .clone()
            .try_into()
            .unwrap();
        assert_eq!(parsed, TlsMode::StartTls);
    }
}
