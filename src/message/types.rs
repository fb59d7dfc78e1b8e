use crate::message::Address;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;

/// A decoded attachment.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Filename as it appeared on the wire.
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
    pub content_id: Option<String>,
    /// Content-Disposition: inline vs attachment.
    pub inline: bool,
}

impl Attachment {
    pub fn new(filename: &str, content_type: &str, data: Vec<u8>) -> Self {
        Self {
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            data,
            content_id: None,
            inline: false,
        }
    }

    /// Filename stripped of path separators and control characters,
    /// safe to use as a disk name. The wire form stays untouched.
    pub fn safe_filename(&self) -> String {
        let cleaned: String = self
            .filename
            .chars()
            .filter(|c| !c.is_control())
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c => c,
            })
            .collect();
        let trimmed = cleaned.trim().trim_matches('.');
        if trimmed.is_empty() {
            "attachment".to_string()
        } else {
            trimmed.to_string()
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// An in-memory message, the unit the engines hand to storage and back.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: String,
    pub subject: String,
    pub from: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<Attachment>,
    pub date: DateTime<Utc>,
    /// All raw headers, lower-cased names.
    pub headers: HashMap<String, String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

impl Message {
    pub fn new(from: Address, to: Vec<Address>, subject: &str) -> Self {
        let domain = from.domain.clone();
        Self {
            message_id: generate_message_id(&domain),
            subject: subject.to_string(),
            from,
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
            text_body: None,
            html_body: None,
            attachments: Vec::new(),
            date: Utc::now(),
            headers: HashMap::new(),
            in_reply_to: None,
            references: Vec::new(),
        }
    }

    pub fn with_text(mut self, body: &str) -> Self {
        self.text_body = Some(body.to_string());
        self
    }

    pub fn with_html(mut self, body: &str) -> Self {
        self.html_body = Some(body.to_string());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Every envelope recipient: To + Cc + Bcc.
    pub fn recipients(&self) -> Vec<&Address> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .collect()
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// Generate a globally unique RFC 5322 msg-id: `<timestamp.random.pid@domain>`.
pub fn generate_message_id(domain: &str) -> String {
    let timestamp = Utc::now().timestamp();
    let nonce: u64 = rand::thread_rng().gen();
    let pid = std::process::id();
    format!("<{}.{:016x}.{}@{}>", timestamp, nonce, pid, domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[test]
    fn test_message_id_shape() {
        let id = generate_message_id("example.com");
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@example.com>"));
        // local part is dot-separated atoms
        let local = &id[1..id.find('@').unwrap()];
        assert_eq!(local.split('.').count(), 3);
    }

    #[test]
    fn test_message_id_unique() {
        let a = generate_message_id("example.com");
        let b = generate_message_id("example.com");
        assert_ne!(a, b);
    }

    #[test]
    fn test_safe_filename() {
        let att = Attachment::new("../../etc/passwd", "text/plain", vec![]);
        let safe = att.safe_filename();
        assert!(!safe.contains('/'));
        assert!(!safe.contains('\\'));

        let att = Attachment::new("re\x00port:v2?.pdf", "application/pdf", vec![]);
        assert_eq!(att.safe_filename(), "report_v2_.pdf");

        // Wire name is preserved verbatim
        assert_eq!(att.filename, "re\x00port:v2?.pdf");
    }

    #[test]
    fn test_recipients_order() {
        let mut msg = Message::new(addr("a@x"), vec![addr("b@y")], "hi");
        msg.cc.push(addr("c@z"));
        msg.bcc.push(addr("d@w"));
        let rcpt: Vec<String> = msg.recipients().iter().map(|a| a.email()).collect();
        assert_eq!(rcpt, vec!["b@y", "c@z", "d@w"]);
    }
}
