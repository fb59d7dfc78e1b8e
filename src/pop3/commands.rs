//! POP3 command parsing (RFC 1939 + CAPA/STLS)

use crate::error::{MailError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop3Command {
    User(String),
    Pass(String),
    Apop { user: String, digest: String },
    Stls,
    Capa,
    Stat,
    /// LIST with an optional message number.
    List(Option<usize>),
    /// UIDL with an optional message number.
    Uidl(Option<usize>),
    Retr(usize),
    Top { msg: usize, lines: usize },
    Dele(usize),
    Rset,
    Noop,
    Quit,
    Unknown(String),
}

impl Pop3Command {
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
            "USER" => {
                if args.is_empty() {
                    return Err(MailError::Protocol("USER requires a name".to_string()));
                }
                Ok(Pop3Command::User(args.to_string()))
            }
            "PASS" => {
                if args.is_empty() {
                    return Err(MailError::Protocol("PASS requires a password".to_string()));
                }
                Ok(Pop3Command::Pass(args.to_string()))
            }
            "APOP" => {
                let (user, digest) = args
                    .split_once(' ')
                    .ok_or_else(|| MailError::Protocol("APOP requires name and digest".to_string()))?;
                Ok(Pop3Command::Apop {
                    user: user.to_string(),
                    digest: digest.trim().to_string(),
                })
            }
            "STLS" => Ok(Pop3Command::Stls),
            "CAPA" => Ok(Pop3Command::Capa),
            "STAT" => Ok(Pop3Command::Stat),
            "LIST" => Ok(Pop3Command::List(parse_optional_number(args)?)),
            "UIDL" => Ok(Pop3Command::Uidl(parse_optional_number(args)?)),
            "RETR" => Ok(Pop3Command::Retr(parse_number(args)?)),
            "TOP" => {
                let (msg, lines) = args
                    .split_once(' ')
                    .ok_or_else(|| MailError::Protocol("TOP requires msg and line count".to_string()))?;
                Ok(Pop3Command::Top {
                    msg: parse_number(msg)?,
                    lines: parse_number(lines.trim())?,
                })
            }
            "DELE" => Ok(Pop3Command::Dele(parse_number(args)?)),
            "RSET" => Ok(Pop3Command::Rset),
            "NOOP" => Ok(Pop3Command::Noop),
            "QUIT" => Ok(Pop3Command::Quit),
            _ => Ok(Pop3Command::Unknown(verb)),
        }
    }
}

fn parse_number(args: &str) -> Result<usize> {
    let n: usize = args
        .trim()
        .parse()
        .map_err(|_| MailError::Protocol(format!("bad message number: {:?}", args)))?;
    if n == 0 {
        return Err(MailError::Protocol("message numbers start at 1".to_string()));
    }
    Ok(n)
}

fn parse_optional_number(args: &str) -> Result<Option<usize>> {
    if args.is_empty() {
        Ok(None)
    } else {
        parse_number(args).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth_commands() {
        assert_eq!(
            Pop3Command::parse("USER alice").unwrap(),
            Pop3Command::User("alice".to_string())
        );
        assert_eq!(
            Pop3Command::parse("pass hunter2").unwrap(),
            Pop3Command::Pass("hunter2".to_string())
        );
        assert_eq!(
            Pop3Command::parse("APOP alice c4c9334bac560ecc979e58001b3e22fb").unwrap(),
            Pop3Command::Apop {
                user: "alice".to_string(),
                digest: "c4c9334bac560ecc979e58001b3e22fb".to_string()
            }
        );
        assert!(Pop3Command::parse("USER").is_err());
        assert!(Pop3Command::parse("APOP alice").is_err());
    }

    #[test]
    fn test_parse_transaction_commands() {
        assert_eq!(Pop3Command::parse("STAT").unwrap(), Pop3Command::Stat);
        assert_eq!(Pop3Command::parse("LIST").unwrap(), Pop3Command::List(None));
        assert_eq!(Pop3Command::parse("LIST 3").unwrap(), Pop3Command::List(Some(3)));
        assert_eq!(Pop3Command::parse("UIDL 2").unwrap(), Pop3Command::Uidl(Some(2)));
        assert_eq!(Pop3Command::parse("RETR 1").unwrap(), Pop3Command::Retr(1));
        assert_eq!(
            Pop3Command::parse("TOP 2 10").unwrap(),
            Pop3Command::Top { msg: 2, lines: 10 }
        );
        assert_eq!(Pop3Command::parse("DELE 1").unwrap(), Pop3Command::Dele(1));
    }

    #[test]
    fn test_message_numbers_are_one_based() {
        assert!(Pop3Command::parse("RETR 0").is_err());
        assert!(Pop3Command::parse("RETR x").is_err());
        assert!(Pop3Command::parse("RETR").is_err());
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            Pop3Command::parse("XFROB 1").unwrap(),
            Pop3Command::Unknown("XFROB".to_string())
        );
    }
}
