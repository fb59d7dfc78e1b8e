//! Bounded line reading and dot-stuffed framing
//!
//! Both protocols are CRLF line protocols with the same transparency rule:
//! a data line starting with `.` is doubled on the wire, and a lone `.`
//! ends a multiline body.

use crate::error::{MailError, Result};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::time::timeout;

/// Per-read limits for a session.
#[derive(Debug, Clone, Copy)]
pub struct LineLimits {
    /// Longest acceptable line including CRLF.
    pub max_line: usize,
    /// How long to wait for a full line before the idle timeout fires.
    pub idle: Duration,
}

impl LineLimits {
    pub fn new(max_line: usize, idle: Duration) -> Self {
        Self { max_line, idle }
    }
}

/// Read one raw line (terminator included).
///
/// Returns `Ok(None)` on clean EOF. A line exceeding `max_line` is a
/// protocol error; the reader cannot resynchronize past it, so callers
/// treat it as connection-fatal. The read is bounded, so an endless
/// unterminated line cannot grow the buffer.
pub async fn read_frame_line<R>(reader: &mut R, limits: &LineLimits) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(128);
    let cap = limits.max_line as u64 + 1;

    let n = timeout(limits.idle, reader.take(cap).read_until(b'\n', &mut buf))
        .await
        .map_err(|_| MailError::Timeout("no complete line received".to_string()))??;

    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() as u64 >= cap {
            return Err(MailError::Protocol(format!(
                "line exceeds {} octets",
                limits.max_line
            )));
        }
        return Err(MailError::Protocol("connection closed mid-line".to_string()));
    }

    Ok(Some(buf))
}

/// Line content without the trailing CRLF (or bare LF).
pub fn trim_line_ending(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    if end > 0 && line[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && line[end - 1] == b'\r' {
        end -= 1;
    }
    &line[..end]
}

/// Encode a body for multiline transmission: normalize line endings to
/// CRLF and double any leading dot. The caller appends the `.` terminator.
pub fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 16);
    let mut at_line_start = true;
    let mut iter = body.iter().peekable();

    while let Some(&b) = iter.next() {
        match b {
            b'.' if at_line_start => {
                out.extend_from_slice(b"..");
                at_line_start = false;
            }
            b'\r' => {
                if iter.peek() == Some(&&b'\n') {
                    iter.next();
                }
                out.extend_from_slice(b"\r\n");
                at_line_start = true;
            }
            b'\n' => {
                out.extend_from_slice(b"\r\n");
                at_line_start = true;
            }
            b => {
                out.push(b);
                at_line_start = false;
            }
        }
    }

    if !at_line_start {
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Invert [`dot_stuff`] on one received line (terminator already removed):
/// strip a single leading dot from a doubled one.
pub fn dot_unstuff_line(line: &[u8]) -> &[u8] {
    if line.starts_with(b".") {
        &line[1..]
    } else {
        line
    }
}
