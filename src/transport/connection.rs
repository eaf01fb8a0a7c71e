//! WebSocket backend.
//!
//! [`WsBackend`] owns one upgraded connection. A dedicated receive thread
//! decodes binary messages into packets and forwards them to the
//! [`EventSink`]; a keepalive timer pings the server on a fixed interval.
//!
//! # Receive Loop
//!
//! | Message | Action |
//! |---------|--------|
//! | Binary | Decode and forward; undecodable messages are logged and dropped |
//! | Text, Pong | Ignored |
//! | Ping | Answered with a pong carrying the same data |
//! | Close | Echoed, then reported as closed |
//!
//! A framing violation closes the connection with status 1002. A connection
//! that ends without a close frame is reported with status 1006. The closed
//! event fires at most once, and never after a local [`close`](Backend::close).

// ============================================================================
// Imports
// ============================================================================

use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use url::Url;

use crate::client::auth::Session;
use crate::error::{Error, Result};
use crate::protocol::{Packet, codec};
use crate::runtime::Timer;

use super::frame::{self, FrameReader, Message, OpCode};
use super::stream::{Endpoint, Stream, StreamReader, StreamWriter};
use super::{Backend, BackendEvent, ConnectOptions, EventSink, session_headers, websocket};

// ============================================================================
// Constants
// ============================================================================

/// Application data carried by keepalive pings.
const PING_PAYLOAD: &[u8] = b"hi";

/// Reason sent when closing without an explicit one.
pub const DEFAULT_CLOSE_REASON: &str = "the connection was closed";

/// Socket read size of the receive loop.
const READ_BUFFER: usize = 16 * 1024;

// ============================================================================
// WsBackend
// ============================================================================

/// Full-duplex backend over a WebSocket connection.
pub struct WsBackend {
    writer: Arc<StreamWriter>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    keepalive: Mutex<Option<Timer>>,
    open: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
}

impl WsBackend {
    /// Connects, upgrades and starts the receive thread and keepalive timer.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the URL has no usable host
    /// - [`Error::Connection`] or [`Error::ConnectionTimeout`] if the socket
    ///   cannot be opened
    /// - [`Error::Tls`] if the TLS handshake fails
    /// - [`Error::Upgrade`] if the server refuses the upgrade
    pub fn connect(
        url: &Url,
        session: &Session,
        options: &ConnectOptions,
        sink: EventSink,
    ) -> Result<Self> {
        let endpoint = Endpoint::from_url(url)?;
        let mut stream = Stream::connect(&endpoint, options.connect_timeout)?;
        stream.set_read_timeout(Some(options.connect_timeout))?;

        let leftover = match websocket::handshake(
            &mut stream,
            &endpoint.host_header(),
            &resource(url),
            &session_headers(session),
        ) {
            Ok(leftover) => leftover,
            Err(e) => {
                stream.shutdown();
                return Err(e);
            }
        };

        let (reader, writer) = stream.split()?;
        let writer = Arc::new(writer);
        let open = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));

        let mut frames = FrameReader::new(options.max_message_size);
        frames.feed(&leftover);

        let receiver = {
            let writer = Arc::clone(&writer);
            let open = Arc::clone(&open);
            let closing = Arc::clone(&closing);
            thread::Builder::new()
                .name("frankly-ws-recv".to_string())
                .spawn(move || receive_loop(reader, frames, &writer, &open, &closing, &sink))?
        };

        let keepalive = {
            let writer = Arc::clone(&writer);
            Timer::start("frankly-ws-ping", options.ping_interval, move || {
                if let Err(e) = writer.write_all(&frame::encode_frame(OpCode::Ping, PING_PAYLOAD)) {
                    debug!(error = %e, "Keepalive ping failed");
                }
            })
        };
        let keepalive = match keepalive {
            Ok(timer) => timer,
            Err(e) => {
                closing.store(true, Ordering::Release);
                writer.shutdown();
                return Err(e);
            }
        };

        debug!(url = %url, "WebSocket backend opened");

        Ok(Self {
            writer,
            receiver: Mutex::new(Some(receiver)),
            keepalive: Mutex::new(Some(keepalive)),
            open,
            closing,
        })
    }
}

impl Backend for WsBackend {
    fn send(&self, packet: &Packet, _timeout: std::time::Duration) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        let bytes = codec::encode(packet)?;
        self.writer
            .write_all(&frame::encode_frame(OpCode::Binary, &bytes))?;
        trace!(id = %packet.id, path = %packet.path_string(), "Packet sent");
        Ok(())
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self, code: u16, reason: &str) {
        let first = !self.closing.swap(true, Ordering::AcqRel);
        self.open.store(false, Ordering::Release);

        if first && !self.writer.is_closed() {
            let payload = frame::encode_close(code, reason);
            if let Err(e) = self
                .writer
                .write_all(&frame::encode_frame(OpCode::Close, &payload))
            {
                trace!(error = %e, "Close frame not sent");
            }
        }
        self.writer.shutdown();

        if let Some(timer) = self.keepalive.lock().take() {
            timer.stop();
            timer.join();
        }

        let receiver = {
            let mut guard = self.receiver.lock();
            match guard.as_ref() {
                Some(h) if h.thread().id() == thread::current().id() => None,
                _ => guard.take(),
            }
        };
        if let Some(handle) = receiver {
            let _ = handle.join();
        }

        if first {
            debug!(code, reason, "WebSocket backend closed");
        }
    }
}

impl Drop for WsBackend {
    fn drop(&mut self) {
        self.close(frame::CLOSE_GOING_AWAY, DEFAULT_CLOSE_REASON);
    }
}

// ============================================================================
// Receive Loop
// ============================================================================

fn receive_loop(
    mut reader: StreamReader,
    mut frames: FrameReader,
    writer: &StreamWriter,
    open: &AtomicBool,
    closing: &AtomicBool,
    sink: &EventSink,
) {
    let (code, reason) = pump(&mut reader, &mut frames, writer, sink);

    open.store(false, Ordering::Release);
    writer.shutdown();

    if closing.swap(true, Ordering::AcqRel) {
        trace!(code, "Receive loop ended after local close");
    } else {
        debug!(code, reason = %reason, "WebSocket closed by peer");
        sink(BackendEvent::Closed { code, reason });
    }
}

/// Reads and dispatches messages until the connection ends.
fn pump(
    reader: &mut StreamReader,
    frames: &mut FrameReader,
    writer: &StreamWriter,
    sink: &EventSink,
) -> (u16, String) {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        loop {
            match frames.next_message() {
                Ok(Some(Message::Binary(data))) => match codec::decode(&data) {
                    Ok(packet) => {
                        trace!(id = %packet.id, path = %packet.path_string(), "Packet received");
                        sink(BackendEvent::Packet(packet));
                    }
                    Err(e) => warn!(error = %e, len = data.len(), "Dropping undecodable message"),
                },
                Ok(Some(Message::Text(_) | Message::Pong(_))) => {}
                Ok(Some(Message::Ping(data))) => {
                    if let Err(e) = writer.write_all(&frame::encode_frame(OpCode::Pong, &data)) {
                        return (frame::CLOSE_ABNORMAL, e.to_string());
                    }
                }
                Ok(Some(Message::Close { code, reason })) => {
                    let echo = frame::encode_close(code, "");
                    let _ = writer.write_all(&frame::encode_frame(OpCode::Close, &echo));
                    return (code, reason);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "WebSocket protocol violation");
                    let payload = frame::encode_close(frame::CLOSE_PROTOCOL_ERROR, "protocol error");
                    let _ = writer.write_all(&frame::encode_frame(OpCode::Close, &payload));
                    return (frame::CLOSE_PROTOCOL_ERROR, e.to_string());
                }
            }
        }

        match reader.read(&mut buf) {
            Ok(0) => return (frame::CLOSE_ABNORMAL, "connection closed by peer".to_string()),
            Ok(n) => frames.feed(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return (frame::CLOSE_ABNORMAL, e.to_string()),
        }
    }
}

/// Returns the request target: path plus query.
fn resource(url: &Url) -> String {
    let mut resource = match url.path() {
        "" => "/".to_string(),
        path => path.to_string(),
    };
    if let Some(query) = url.query() {
        resource.push('?');
        resource.push_str(query);
    }
    resource
}

// ============================================================================
// Tests
// ============================================================================
