//! MIME parsing and framing
//!
//! Converts between wire octets (RFC 5322 + MIME) and the structured
//! [`Message`] type. Handles multipart splitting, base64 and
//! quoted-printable transfer encodings, and RFC 2047 encoded words in
//! headers.

use crate::error::{MailError, Result};
use crate::message::types::{generate_message_id, Attachment, Message};
use crate::message::Address;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// One body part of a multipart message before categorization.
#[derive(Debug, Clone, Default)]
struct MimePart {
    content_type: String,
    content_disposition: Option<String>,
    filename: Option<String>,
    content_id: Option<String>,
    encoding: Option<String>,
    body: Vec<u8>,
}

/// MIME message parser.
pub struct MimeParser;

impl MimeParser {
    /// Parse raw message bytes into a structured [`Message`].
    ///
    /// Unknown or malformed structure degrades to a plain-text body rather
    /// than failing; a message we stored must always be retrievable.
    pub fn parse(raw: &[u8]) -> Result<Message> {
        let text = String::from_utf8_lossy(raw);
        let (header_str, body_str) = split_headers_body(&text);
        let headers = parse_headers(&header_str);

        let from = headers
            .get("from")
            .and_then(|v| Address::parse(&decode_rfc2047(v)).ok())
            .unwrap_or_else(|| Address {
                name: None,
                local: "unknown".to_string(),
                domain: "invalid".to_string(),
            });

        let to = headers
            .get("to")
            .and_then(|v| Address::parse_list(&decode_rfc2047(v)).ok())
            .unwrap_or_default();
        let cc = headers
            .get("cc")
            .and_then(|v| Address::parse_list(&decode_rfc2047(v)).ok())
            .unwrap_or_default();

        let date = headers
            .get("date")
            .and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let message_id = headers
            .get("message-id")
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| generate_message_id(&from.domain));

        let in_reply_to = headers.get("in-reply-to").map(|v| v.trim().to_string());
        let references = headers
            .get("references")
            .map(|v| v.split_whitespace().map(|s| s.to_string()).collect())
            .unwrap_or_default();

        let mut message = Message {
            message_id,
            subject: headers
                .get("subject")
                .map(|s| decode_rfc2047(s))
                .unwrap_or_default(),
            from,
            to,
            cc,
            bcc: Vec::new(),
            text_body: None,
            html_body: None,
            attachments: Vec::new(),
            date,
            headers: headers.clone(),
            in_reply_to,
            references,
        };

        let root = MimePart {
            content_type: headers
                .get("content-type")
                .cloned()
                .unwrap_or_else(|| "text/plain".to_string()),
            encoding: headers.get("content-transfer-encoding").cloned(),
            body: body_str.as_bytes().to_vec(),
            ..Default::default()
        };
        categorize_part(&mut message, root);

        Ok(message)
    }

    /// Parse just the header block of raw message bytes.
    ///
    /// Used at the commit boundary where only metadata is needed.
    pub fn parse_headers(raw: &[u8]) -> HashMap<String, String> {
        let text = String::from_utf8_lossy(raw);
        let (header_str, _) = split_headers_body(&text);
        parse_headers(&header_str)
    }

    /// Extract the Message-ID header from raw bytes, if present.
    pub fn extract_message_id(raw: &[u8]) -> Option<String> {
        let headers = Self::parse_headers(raw);
        headers
            .get("message-id")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

fn split_headers_body(text: &str) -> (String, String) {
    if let Some(pos) = text.find("\r\n\r\n") {
        (text[..pos].to_string(), text[pos + 4..].to_string())
    } else if let Some(pos) = text.find("\n\n") {
        (text[..pos].to_string(), text[pos + 2..].to_string())
    } else {
        (text.to_string(), String::new())
    }
}

/// Parse a header block into lower-cased name → unfolded value.
fn parse_headers(header_str: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    let mut current: Option<(String, String)> = None;

    for line in header_str.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation
            if let Some((_, ref mut value)) = current {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some(colon) = line.find(':') {
            if let Some((name, value)) = current.take() {
                headers.insert(name, value);
            }
            let name = line[..colon].trim().to_lowercase();
            let value = line[colon + 1..].trim().to_string();
            current = Some((name, value));
        }
    }
    if let Some((name, value)) = current {
        headers.insert(name, value);
    }

    headers
}

/// Walk a part, recursing into nested multiparts, and attach leaves to the
/// message as text body, html body or attachment.
fn categorize_part(message: &mut Message, part: MimePart) {
    let ctype = part.content_type.to_lowercase();

    if ctype.contains("multipart/") {
        if let Some(boundary) = extract_boundary(&part.content_type) {
            let body = String::from_utf8_lossy(&part.body).to_string();
            for sub in split_multipart(&boundary, &body) {
                categorize_part(message, sub);
            }
        } else if message.text_body.is_none() {
            message.text_body = Some(decode_text(&part));
        }
        return;
    }

    let is_attachment = part
        .content_disposition
        .as_deref()
        .map(|d| d.to_lowercase().contains("attachment"))
        .unwrap_or(false)
        || part.filename.is_some() && !ctype.starts_with("text/");

    if is_attachment || part.filename.is_some() {
        let filename = part
            .filename
            .clone()
            .unwrap_or_else(|| "attachment".to_string());
        let mime_type = ctype
            .split(';')
            .next()
            .unwrap_or("application/octet-stream")
            .trim()
            .to_string();
        let inline = part
            .content_disposition
            .as_deref()
            .map(|d| d.to_lowercase().contains("inline"))
            .unwrap_or(false);
        message.attachments.push(Attachment {
            filename,
            content_type: mime_type,
            data: decode_binary(&part),
            content_id: part.content_id.clone(),
            inline,
        });
    } else if ctype.starts_with("text/html") {
        if message.html_body.is_none() {
            message.html_body = Some(decode_text(&part));
        }
    } else if message.text_body.is_none() {
        message.text_body = Some(decode_text(&part));
    }
}

fn extract_boundary(content_type: &str) -> Option<String> {
    for piece in content_type.split(';') {
        let piece = piece.trim();
        if let Some(rest) = piece
            .strip_prefix("boundary=")
            .or_else(|| piece.strip_prefix("BOUNDARY="))
        {
            return Some(rest.trim_matches('"').trim_matches('\'').to_string());
        }
    }
    None
}

fn split_multipart(boundary: &str, body: &str) -> Vec<MimePart> {
    let marker = format!("--{}", boundary);
    let mut parts = Vec::new();

    for section in body.split(&marker) {
        let section = section.trim_start_matches(['\r', '\n']);
        // Preamble before the first marker, and the "--" tail after the
        // closing marker, are not parts.
        if section.is_empty() || section.starts_with("--") {
            continue;
        }

        let (header_str, part_body) = split_headers_body(section);
        let headers = parse_headers(&header_str);
        if headers.is_empty() && part_body.is_empty() {
            continue;
        }

        let content_type = headers
            .get("content-type")
            .cloned()
            .unwrap_or_else(|| "text/plain".to_string());
        let content_disposition = headers.get("content-disposition").cloned();
        let filename = content_disposition
            .as_deref()
            .and_then(extract_param_filename)
            .or_else(|| extract_param_filename(&content_type))
            .map(|f| decode_rfc2047(&f));
        let content_id = headers
            .get("content-id")
            .map(|v| v.trim().trim_matches(['<', '>']).to_string());

        parts.push(MimePart {
            content_type,
            content_disposition,
            filename,
            content_id,
            encoding: headers.get("content-transfer-encoding").cloned(),
            body: part_body
                .trim_end_matches(['\r', '\n'])
                .as_bytes()
                .to_vec(),
        });
    }

    parts
}

/// Pull `filename="..."` or `name="..."` out of a header parameter list.
fn extract_param_filename(value: &str) -> Option<String> {
    for piece in value.split(';') {
        let piece = piece.trim();
        let lower = piece.to_lowercase();
        for key in ["filename=", "name="] {
            if lower.starts_with(key) {
                let raw = &piece[key.len()..];
                return Some(raw.trim_matches('"').trim_matches('\'').to_string());
            }
        }
    }
    None
}

fn decode_binary(part: &MimePart) -> Vec<u8> {
    match part.encoding.as_deref().map(|e| e.trim().to_lowercase()) {
        Some(enc) if enc == "base64" => {
            let compact: String = String::from_utf8_lossy(&part.body)
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            BASE64.decode(compact.as_bytes()).unwrap_or_else(|_| part.body.clone())
        }
        Some(enc) if enc == "quoted-printable" => {
            decode_quoted_printable(&String::from_utf8_lossy(&part.body))
        }
        _ => part.body.clone(),
    }
}

fn decode_text(part: &MimePart) -> String {
    String::from_utf8_lossy(&decode_binary(part)).to_string()
}

/// Decode RFC 2047 encoded words (`=?charset?B|Q?data?=`) in a header value.
///
/// Charsets are decoded as UTF-8 with lossy fallback; that covers the
/// us-ascii and utf-8 words this platform emits and reads.
pub fn decode_rfc2047(value: &str) -> String {
    let mut out = String::new();
    let mut rest = value;

    while let Some(start) = rest.find("=?") {
        let (before, tail) = rest.split_at(start);
        // Whitespace between adjacent encoded words is dropped
        if !(out.ends_with(|c: char| !c.is_whitespace()) && before.trim().is_empty()) {
            out.push_str(before);
        }

        let Some(end) = tail[2..].find("?=").map(|i| i + 4) else {
            out.push_str(tail);
            return out;
        };
        let word = &tail[..end];
        let fields: Vec<&str> = word[2..word.len() - 2].splitn(3, '?').collect();

        if fields.len() == 3 {
            let decoded = match fields[1].to_ascii_uppercase().as_str() {
                "B" => BASE64
                    .decode(fields[2].as_bytes())
                    .map(|b| String::from_utf8_lossy(&b).to_string())
                    .ok(),
                "Q" => Some(String::from_utf8_lossy(&decode_q_encoding(fields[2])).to_string()),
                _ => None,
            };
            match decoded {
                Some(d) => out.push_str(&d),
                None => out.push_str(word),
            }
        } else {
            out.push_str(word);
        }

        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}

/// Encode a header value as an RFC 2047 word when it leaves ASCII.
pub fn encode_rfc2047(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?utf-8?B?{}?=", BASE64.encode(value.as_bytes()))
    }
}

fn decode_quoted_printable(input: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chars = input.bytes().peekable();

    while let Some(b) = chars.next() {
        if b != b'=' {
            out.push(b);
            continue;
        }
        match (chars.next(), chars.peek().copied()) {
            // Soft line break
            (Some(b'\r'), Some(b'\n')) => {
                chars.next();
            }
            (Some(b'\n'), _) => {}
            (Some(hi), Some(lo)) => {
                let pair = [hi, lo];
                if let Ok(byte) = u8::from_str_radix(&String::from_utf8_lossy(&pair), 16) {
                    out.push(byte);
                    chars.next();
                } else {
                    out.push(b'=');
                    out.push(hi);
                }
            }
            (Some(other), None) => {
                out.push(b'=');
                out.push(other);
            }
            (None, _) => out.push(b'='),
        }
    }
    out
}

/// Q-encoding is quoted-printable with `_` standing for space.
fn decode_q_encoding(input: &str) -> Vec<u8> {
    decode_quoted_printable(&input.replace('_', " "))
}

/// Frames a [`Message`] into RFC 5322 wire bytes with CRLF line endings.
pub struct MessageBuilder;

impl MessageBuilder {
    /// Build the full wire form: headers, then body, multipart as needed.
    pub fn build(message: &Message) -> Result<Vec<u8>> {
        let mut out = String::new();

        push_header(&mut out, "Message-ID", &message.message_id);
        push_header(&mut out, "Date", &message.date.to_rfc2822());
        push_header(&mut out, "From", &message.from.to_string());
        if !message.to.is_empty() {
            push_header(&mut out, "To", &join_addresses(&message.to));
        }
        if !message.cc.is_empty() {
            push_header(&mut out, "Cc", &join_addresses(&message.cc));
        }
        push_header(&mut out, "Subject", &encode_rfc2047(&message.subject));
        if let Some(ref irt) = message.in_reply_to {
            push_header(&mut out, "In-Reply-To", irt);
        }
        if !message.references.is_empty() {
            push_header(&mut out, "References", &message.references.join(" "));
        }
        push_header(&mut out, "MIME-Version", "1.0");

        let mut body = Vec::new();
        if message.has_attachments() {
            let boundary = make_boundary("mixed");
            push_header(
                &mut out,
                "Content-Type",
                &format!("multipart/mixed; boundary=\"{}\"", boundary),
            );
            out.push_str("\r\n");
            body.extend_from_slice(
                build_mixed_body(message, &boundary)?.as_slice(),
            );
        } else if message.html_body.is_some() && message.text_body.is_some() {
            let boundary = make_boundary("alt");
            push_header(
                &mut out,
                "Content-Type",
                &format!("multipart/alternative; boundary=\"{}\"", boundary),
            );
            out.push_str("\r\n");
            body.extend_from_slice(build_alternative_body(message, &boundary).as_bytes());
        } else if let Some(ref html) = message.html_body {
            body.extend_from_slice(single_text_part(&mut out, "text/html", html).as_bytes());
        } else {
            let text = message.text_body.as_deref().unwrap_or("");
            body.extend_from_slice(single_text_part(&mut out, "text/plain", text).as_bytes());
        }

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

fn join_addresses(addrs: &[Address]) -> String {
    addrs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn make_boundary(label: &str) -> String {
    use rand::Rng;
    let nonce: u64 = rand::thread_rng().gen();
    format!("----=_{}_{:016x}", label, nonce)
}

/// Text part with its own headers; used when the whole message is one part.
fn single_text_part(headers: &mut String, mime_type: &str, text: &str) -> String {
    push_header(
        headers,
        "Content-Type",
        &format!("{}; charset=utf-8", mime_type),
    );
    if text.is_ascii() {
        push_header(headers, "Content-Transfer-Encoding", "7bit");
        headers.push_str("\r\n");
        normalize_crlf(text)
    } else {
        push_header(headers, "Content-Transfer-Encoding", "base64");
        headers.push_str("\r\n");
        wrap_base64(&BASE64.encode(text.as_bytes()))
    }
}

fn text_subpart(mime_type: &str, text: &str) -> String {
    let mut part = String::new();
    if text.is_ascii() {
        push_header(
            &mut part,
            "Content-Type",
            &format!("{}; charset=utf-8", mime_type),
        );
        push_header(&mut part, "Content-Transfer-Encoding", "7bit");
        part.push_str("\r\n");
        part.push_str(&normalize_crlf(text));
    } else {
        push_header(
            &mut part,
            "Content-Type",
            &format!("{}; charset=utf-8", mime_type),
        );
        push_header(&mut part, "Content-Transfer-Encoding", "base64");
        part.push_str("\r\n");
        part.push_str(&wrap_base64(&BASE64.encode(text.as_bytes())));
    }
    part
}

fn build_alternative_body(message: &Message, boundary: &str) -> String {
    let mut body = String::new();
    if let Some(ref text) = message.text_body {
        body.push_str(&format!("--{}\r\n", boundary));
        body.push_str(&text_subpart("text/plain", text));
        body.push_str("\r\n");
    }
    if let Some(ref html) = message.html_body {
        body.push_str(&format!("--{}\r\n", boundary));
        body.push_str(&text_subpart("text/html", html));
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{}--\r\n", boundary));
    body
}

fn build_mixed_body(message: &Message, boundary: &str) -> Result<Vec<u8>> {
    let mut body = String::new();

    // Text content first, as its own part or nested alternative
    body.push_str(&format!("--{}\r\n", boundary));
    if message.html_body.is_some() && message.text_body.is_some() {
        let alt_boundary = make_boundary("alt");
        push_header(
            &mut body,
            "Content-Type",
            &format!("multipart/alternative; boundary=\"{}\"", alt_boundary),
        );
        body.push_str("\r\n");
        body.push_str(&build_alternative_body(message, &alt_boundary));
    } else if let Some(ref html) = message.html_body {
        body.push_str(&text_subpart("text/html", html));
    } else {
        body.push_str(&text_subpart(
            "text/plain",
            message.text_body.as_deref().unwrap_or(""),
        ));
    }
    body.push_str("\r\n");

    for attachment in &message.attachments {
        if attachment.filename.len() > 255 {
            return Err(MailError::Protocol(format!(
                "attachment filename too long: {} chars",
                attachment.filename.len()
            )));
        }
        body.push_str(&format!("--{}\r\n", boundary));
        push_header(
            &mut body,
            "Content-Type",
            &format!(
                "{}; name=\"{}\"",
                attachment.content_type,
                encode_rfc2047(&attachment.filename)
            ),
        );
        let disposition = if attachment.inline { "inline" } else { "attachment" };
        push_header(
            &mut body,
            "Content-Disposition",
            &format!(
                "{}; filename=\"{}\"",
                disposition,
                encode_rfc2047(&attachment.filename)
            ),
        );
        if let Some(ref cid) = attachment.content_id {
            push_header(&mut body, "Content-ID", &format!("<{}>", cid));
        }
        push_header(&mut body, "Content-Transfer-Encoding", "base64");
        body.push_str("\r\n");
        body.push_str(&wrap_base64(&BASE64.encode(&attachment.data)));
        body.push_str("\r\n");
    }

    body.push_str(&format!("--{}--\r\n", boundary));
    Ok(body.into_bytes())
}

fn normalize_crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_cr = false;
    for c in text.chars() {
        match c {
            '\r' => {
                prev_cr = true;
                out.push('\r');
            }
            '\n' => {
                if !prev_cr {
                    out.push('\r');
                }
                out.push('\n');
                prev_cr = false;
            }
            c => {
                prev_cr = false;
                out.push(c);
            }
        }
    }
    if !out.ends_with('\n') {
        out.push_str("\r\n");
    }
    out
}

fn wrap_base64(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len() + encoded.len() / 76 * 2 + 2);
    for chunk in encoded.as_bytes().chunks(76) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push_str("\r\n");
    }
    out
}
