//! HTTP/1.1 upgrade exchange.
//!
//! Just enough HTTP for the WebSocket upgrade: write a request and read the
//! response head. Bytes after the head stay in the reader's buffer, since
//! they already belong to the frame stream.

// ============================================================================
// Imports
// ============================================================================

use std::io::{BufRead, Read, Write};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Longest accepted status or header line.
const MAX_LINE: u64 = 8 * 1024;

/// Most header lines accepted in one response.
const MAX_HEADERS: usize = 128;

// ============================================================================
// Request
// ============================================================================

/// Writes a request with the given headers and body, then flushes.
///
/// `Host` and, for a non-empty body, `Content-Length` are added
/// automatically.
///
/// # Errors
///
/// Returns [`Error::Io`] if the write fails.
pub fn write_request<W: Write>(
    writer: &mut W,
    method: &str,
    target: &str,
    host: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Result<()> {
    let mut head = format!("{method} {target} HTTP/1.1\r\nHost: {host}\r\n");
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if !body.is_empty() {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");

    let mut buf = head.into_bytes();
    buf.extend_from_slice(body);
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

// ============================================================================
// Response
// ============================================================================

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    /// Headers in received order.
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Returns the first value of a header, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Reads a response head, leaving the reader positioned at the body.
///
/// # Errors
///
/// - [`Error::Connection`] if the peer closes before the head is complete
/// - [`Error::Protocol`] if the head is malformed or too large
pub fn read_head<R: BufRead>(reader: &mut R) -> Result<ResponseHead> {
    let status_line = read_line(reader)?;
    if status_line.is_empty() {
        return Err(Error::connection("connection closed before response"));
    }

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(Error::protocol(format!("bad status line: {status_line}")));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| Error::protocol(format!("bad status line: {status_line}")))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader)?;
        if line.is_empty() {
            break;
        }
        if headers.len() == MAX_HEADERS {
            return Err(Error::protocol("too many response headers"));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::protocol(format!("bad header line: {line}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(ResponseHead {
        status,
        reason,
        headers,
    })
}

/// Reads one CRLF- or LF-terminated line without its terminator.
fn read_line<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut line = Vec::new();
    reader.by_ref().take(MAX_LINE).read_until(b'\n', &mut line)?;
    if !line.ends_with(b"\n") {
        if line.len() as u64 == MAX_LINE {
            return Err(Error::protocol("response line too long"));
        }
        if !line.is_empty() {
            return Err(Error::connection("connection closed mid-line"));
        }
    }
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| Error::protocol("response line is not valid UTF-8"))
}

// ============================================================================
// Tests
// ============================================================================
