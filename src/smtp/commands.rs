//! SMTP command parsing (RFC 5321 grammar subset)

use crate::error::{MailError, Result};

/// One parsed command line.
#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    StartTls,
    /// AUTH mechanism with optional initial response.
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    /// MAIL FROM with the reverse-path (empty for the null path `<>`)
    /// and the declared SIZE parameter when present.
    MailFrom {
        reverse_path: String,
        declared_size: Option<usize>,
    },
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy(String),
    Expn(String),
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(MailError::Protocol("empty command".to_string()));
        }

        let (verb, args) = match line.split_once(' ') {
            Some((v, a)) => (v.to_uppercase(), a.trim()),
            None => (line.to_uppercase(), ""),
        };

        match verb.as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(MailError::Protocol("HELO requires a domain".to_string()));
                }
                Ok(SmtpCommand::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(MailError::Protocol("EHLO requires a domain".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "STARTTLS" => Ok(SmtpCommand::StartTls),
            "AUTH" => {
                if args.is_empty() {
                    return Err(MailError::Protocol("AUTH requires a mechanism".to_string()));
                }
                let (mechanism, initial) = match args.split_once(' ') {
                    Some((m, i)) => (m.to_string(), Some(i.trim().to_string())),
                    None => (args.to_string(), None),
                };
                Ok(SmtpCommand::Auth { mechanism, initial })
            }
            "MAIL" => Self::parse_mail(args),
            "RCPT" => Self::parse_rcpt(args),
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "NOOP" => Ok(SmtpCommand::Noop),
            "QUIT" => Ok(SmtpCommand::Quit),
            "VRFY" => Ok(SmtpCommand::Vrfy(args.to_string())),
            "EXPN" => Ok(SmtpCommand::Expn(args.to_string())),
            _ => Ok(SmtpCommand::Unknown(verb)),
        }
    }

    /// `FROM:<path> [SIZE=n] [BODY=...]`. Unrecognized ESMTP parameters
    /// are tolerated; a malformed SIZE is not.
    fn parse_mail(args: &str) -> Result<Self> {
        let rest = strip_keyword(args, "FROM:")
            .ok_or_else(|| MailError::Protocol("MAIL requires FROM:<path>".to_string()))?;

        let (path_part, params) = split_path_and_params(rest);
        let reverse_path = extract_path(path_part)?;

        let mut declared_size = None;
        for param in params.split_whitespace() {
            let (key, value) = match param.split_once('=') {
                Some((k, v)) => (k.to_uppercase(), v),
                None => (param.to_uppercase(), ""),
            };
            if key == "SIZE" {
                let size: usize = value.parse().map_err(|_| {
                    MailError::Protocol(format!("bad SIZE parameter: {}", value))
                })?;
                declared_size = Some(size);
            }
        }

        Ok(SmtpCommand::MailFrom {
            reverse_path,
            declared_size,
        })
    }

    fn parse_rcpt(args: &str) -> Result<Self> {
        let rest = strip_keyword(args, "TO:")
            .ok_or_else(|| MailError::Protocol("RCPT requires TO:<path>".to_string()))?;

        let (path_part, _params) = split_path_and_params(rest);
        let forward_path = extract_path(path_part)?;
        if forward_path.is_empty() {
            return Err(MailError::Protocol("empty forward-path".to_string()));
        }
        Ok(SmtpCommand::RcptTo(forward_path))
    }
}

fn strip_keyword<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    if args.len() >= keyword.len() && args[..keyword.len()].eq_ignore_ascii_case(keyword) {
        Some(args[keyword.len()..].trim_start())
    } else {
        None
    }
}

/// Split `<path> PARAM=...` into the path portion and the parameter tail.
fn split_path_and_params(rest: &str) -> (&str, &str) {
    let rest = rest.trim();
    if rest.starts_with('<') {
        if let Some(end) = rest.find('>') {
            return (&rest[..=end], rest[end + 1..].trim_start());
        }
    }
    match rest.split_once(' ') {
        Some((path, params)) => (path, params),
        None => (rest, ""),
    }
}

/// Strip optional angle brackets from a path. The null path `<>` becomes
/// the empty string.
fn extract_path(path: &str) -> Result<String> {
    let path = path.trim();
    let inner = if path.starts_with('<') {
        if !path.ends_with('>') {
            return Err(MailError::Protocol(format!("unterminated path: {}", path)));
        }
        &path[1..path.len() - 1]
    } else {
        path
    };
    Ok(inner.trim().to_string())
}
