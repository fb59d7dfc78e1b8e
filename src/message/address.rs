//! Email address grammar
//!
//! Conservative subset of RFC 5322 addr-spec: enough to validate what the
//! servers accept and to render display-name forms on the wire.

use crate::error::{MailError, Result};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

fn local_part_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9!#$%&'*+/=?^_`{|}~](\.?[A-Za-z0-9!#$%&'*+/=?^_`{|}~-])*$").unwrap())
}

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?)*$").unwrap())
}

/// A single mailbox: optional display name plus `local@domain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub name: Option<String>,
    pub local: String,
    pub domain: String,
}

impl Address {
    pub fn new(local: &str, domain: &str) -> Result<Self> {
        validate_local(local)?;
        validate_domain(domain)?;
        Ok(Self {
            name: None,
            local: local.to_string(),
            domain: domain.to_string(),
        })
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// The bare `local@domain` form.
    pub fn email(&self) -> String {
        format!("{}@{}", self.local, self.domain)
    }

    /// Parse `Name <l@d>`, `"Quoted Name" <l@d>` or bare `l@d`.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(MailError::InvalidAddress("empty address".to_string()));
        }

        let (name, spec) = match (input.rfind('<'), input.rfind('>')) {
            (Some(lt), Some(gt)) if lt < gt => {
                let raw_name = input[..lt].trim();
                let name = if raw_name.is_empty() {
                    None
                } else {
                    Some(unquote(raw_name))
                };
                (name, input[lt + 1..gt].trim())
            }
            (None, None) => (None, input),
            _ => {
                return Err(MailError::InvalidAddress(format!(
                    "unbalanced angle brackets: {}",
                    input
                )))
            }
        };

        let at = spec
            .rfind('@')
            .ok_or_else(|| MailError::InvalidAddress(format!("missing @: {}", spec)))?;
        let (local, domain) = (&spec[..at], &spec[at + 1..]);

        validate_local(local)?;
        validate_domain(domain)?;

        Ok(Self {
            name,
            local: local.to_string(),
            domain: domain.to_string(),
        })
    }

    /// Parse a comma-separated header value into addresses.
    ///
    /// Commas inside quoted display names do not split.
    pub fn parse_list(input: &str) -> Result<Vec<Self>> {
        let mut out = Vec::new();
        let mut depth_quote = false;
        let mut start = 0;

        for (i, c) in input.char_indices() {
            match c {
                '"' => depth_quote = !depth_quote,
                ',' if !depth_quote => {
                    let piece = input[start..i].trim();
                    if !piece.is_empty() {
                        out.push(Self::parse(piece)?);
                    }
                    start = i + 1;
                }
                _ => {}
            }
        }
        let piece = input[start..].trim();
        if !piece.is_empty() {
            out.push(Self::parse(piece)?);
        }

        Ok(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) if needs_quoting(name) => {
                write!(f, "\"{}\" <{}@{}>", name.replace('"', "\\\""), self.local, self.domain)
            }
            Some(name) => write!(f, "{} <{}@{}>", name, self.local, self.domain),
            None => write!(f, "{}@{}", self.local, self.domain),
        }
    }
}

impl FromStr for Address {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn validate_local(local: &str) -> Result<()> {
    if local.is_empty() || local.len() > 64 {
        return Err(MailError::InvalidAddress(format!(
            "local part length invalid: {:?}",
            local
        )));
    }
    if !local_part_re().is_match(local) {
        return Err(MailError::InvalidAddress(format!(
            "local part contains invalid characters: {:?}",
            local
        )));
    }
    Ok(())
}

fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() || domain.len() > 255 {
        return Err(MailError::InvalidAddress(format!(
            "domain length invalid: {:?}",
            domain
        )));
    }
    if !domain_re().is_match(domain) {
        return Err(MailError::InvalidAddress(format!(
            "domain contains invalid characters: {:?}",
            domain
        )));
    }
    Ok(())
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].replace("\\\"", "\"")
    } else {
        s.to_string()
    }
}

fn needs_quoting(name: &str) -> bool {
    name.chars().any(|c| {
        !(c.is_ascii_alphanumeric() || c == ' ' || c == '.' || c == '-' || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare() {
        let a = Address::parse("alice@example.com").unwrap();
        assert_eq!(a.local, "alice");
        assert_eq!(a.domain, "example.com");
        assert!(a.name.is_none());
        assert_eq!(a.to_string(), "alice@example.com");
    }

    #[test]
    fn test_parse_named() {
        let a = Address::parse("Alice Liddell <alice@example.com>").unwrap();
        assert_eq!(a.name.as_deref(), Some("Alice Liddell"));
        assert_eq!(a.email(), "alice@example.com");
        assert_eq!(a.to_string(), "Alice Liddell <alice@example.com>");
    }

    #[test]
    fn test_parse_quoted_name() {
        let a = Address::parse("\"Liddell, Alice\" <alice@example.com>").unwrap();
        assert_eq!(a.name.as_deref(), Some("Liddell, Alice"));
        // Comma forces quoting on output
        assert_eq!(a.to_string(), "\"Liddell, Alice\" <alice@example.com>");
    }

    #[test]
    fn test_single_label_domain() {
        // Local delivery setups use bare hostnames
        assert!(Address::parse("a@x").is_ok());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("no-at-sign").is_err());
        assert!(Address::parse("a b@example.com").is_err());
        assert!(Address::parse("<unclosed@example.com").is_err());
        assert!(Address::parse("a@-bad-.com").is_err());
    }

    #[test]
    fn test_parse_list_with_quoted_comma() {
        let list =
            Address::parse_list("\"Liddell, Alice\" <alice@x.com>, bob@y.com").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].email(), "alice@x.com");
        assert_eq!(list[1].email(), "bob@y.com");
    }
}
