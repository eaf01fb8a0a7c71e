//! WebSocket opening handshake (RFC 6455 section 4).

// ============================================================================
// Imports
// ============================================================================

use std::io::{BufRead, BufReader, Read, Write};

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::{Error, Result};

use super::http::{self, ResponseHead};

// ============================================================================
// Constants
// ============================================================================

/// GUID appended to the key when computing the accept value.
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Protocol version sent and accepted.
pub const VERSION: &str = "13";

/// Subprotocol offered to the service.
pub const SUBPROTOCOL: &str = "chat";

// ============================================================================
// Keys
// ============================================================================

/// Generates a random base64-encoded 16-byte key.
#[must_use]
pub fn generate_key() -> String {
    BASE64_STANDARD.encode(rand::random::<[u8; 16]>())
}

/// Computes `Sec-WebSocket-Accept` for a key.
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

// ============================================================================
// Handshake
// ============================================================================

/// Performs the client handshake over `stream`.
///
/// Returns any bytes received after the response head; they are the start
/// of the frame stream.
///
/// # Errors
///
/// - [`Error::Upgrade`] if the server refuses or answers incorrectly
/// - [`Error::Protocol`] if the response head is malformed
/// - [`Error::Io`] if the exchange fails
pub fn handshake<S: Read + Write>(
    stream: &mut S,
    host: &str,
    resource: &str,
    headers: &[(String, String)],
) -> Result<Vec<u8>> {
    let key = generate_key();

    let mut request_headers = vec![
        ("Upgrade".to_string(), "websocket".to_string()),
        ("Connection".to_string(), "Upgrade".to_string()),
        ("Sec-WebSocket-Key".to_string(), key.clone()),
        ("Sec-WebSocket-Version".to_string(), VERSION.to_string()),
        ("Sec-WebSocket-Protocol".to_string(), SUBPROTOCOL.to_string()),
    ];
    request_headers.extend_from_slice(headers);

    http::write_request(stream, "GET", resource, host, &request_headers, &[])?;

    let mut reader = BufReader::new(stream);
    let head = http::read_head(&mut reader)?;
    validate_response(&head, &key)?;

    let leftover = reader.buffer().to_vec();
    reader.consume(leftover.len());

    debug!(host, resource, leftover = leftover.len(), "WebSocket handshake completed");
    Ok(leftover)
}

/// Checks an upgrade response against the key that was sent.
///
/// # Errors
///
/// Returns [`Error::Upgrade`] describing the first mismatch.
pub fn validate_response(head: &ResponseHead, key: &str) -> Result<()> {
    if head.status != 101 {
        return Err(Error::upgrade(format!(
            "unexpected status {} {}",
            head.status, head.reason
        )));
    }

    let upgrade = head.header("upgrade").unwrap_or_default();
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(Error::upgrade(format!("unexpected Upgrade header '{upgrade}'")));
    }

    let expected = accept_key(key);
    match head.header("sec-websocket-accept") {
        Some(accept) if accept == expected => {}
        Some(accept) => {
            return Err(Error::upgrade(format!(
                "Sec-WebSocket-Accept mismatch: expected {expected}, got {accept}"
            )));
        }
        None => return Err(Error::upgrade("missing Sec-WebSocket-Accept")),
    }

    if let Some(version) = head.header("sec-websocket-version")
        && version != VERSION
    {
        return Err(Error::upgrade(format!("unsupported version {version}")));
    }

    if let Some(protocol) = head.header("sec-websocket-protocol")
        && protocol != SUBPROTOCOL
    {
        return Err(Error::upgrade(format!("unexpected subprotocol '{protocol}'")));
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
