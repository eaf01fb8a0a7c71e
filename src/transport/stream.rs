//! Blocking TCP and TLS streams.
//!
//! [`Stream`] is a connected socket, optionally wrapped in rustls. The
//! WebSocket backend splits it into a [`StreamReader`] owned by the receive
//! thread and a [`StreamWriter`] shared by senders.
//!
//! A TLS session cannot be read and written from two threads at once, so the
//! TLS reader polls: it holds the session lock only for one short read with a
//! socket timeout, leaving gaps for the writer.

// ============================================================================
// Imports
// ============================================================================

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use rustls_platform_verifier::BuilderVerifierExt;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Socket read timeout used by the polling TLS reader.
const TLS_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Types
// ============================================================================

type TlsStream = StreamOwned<ClientConnection, TcpStream>;

#[derive(Clone)]
enum Inner {
    Plain(Arc<TcpStream>),
    Tls(Arc<Mutex<TlsStream>>),
}

// ============================================================================
// Endpoint
// ============================================================================

/// Host, port and TLS flag derived from a service URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address literal, without IPv6 brackets.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Whether the connection is wrapped in TLS.
    pub tls: bool,
}

impl Endpoint {
    /// Derives the endpoint for an `http`, `https`, `ws` or `wss` URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for other schemes or a URL without a host.
    pub fn from_url(url: &Url) -> Result<Self> {
        let tls = match url.scheme() {
            "http" | "ws" => false,
            "https" | "wss" => true,
            other => return Err(Error::config(format!("unsupported scheme '{other}'"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::config(format!("URL has no host: {url}")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .unwrap_or(if tls { 443 } else { 80 });

        Ok(Self { host, port, tls })
    }

    /// Returns the `Host` header value.
    #[must_use]
    pub fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

// ============================================================================
// Stream
// ============================================================================

/// A connected, optionally TLS-wrapped socket.
pub struct Stream {
    inner: Inner,
    socket: TcpStream,
}

impl Stream {
    /// Connects to `endpoint`, giving up after `timeout` per resolved address.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionTimeout`] if no address answered in time
    /// - [`Error::Connection`] if the host does not resolve or refuses
    /// - [`Error::Tls`] if the TLS handshake fails
    pub fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        let addrs = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|e| Error::connection(format!("failed to resolve {}: {e}", endpoint.host)))?;

        let mut last_error = Error::connection(format!("no address for {}", endpoint.host));
        let mut tcp = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    last_error = Error::connection_timeout(duration_ms(timeout));
                }
                Err(e) => {
                    last_error = Error::connection(format!("failed to connect to {addr}: {e}"));
                }
            }
        }
        let tcp = tcp.ok_or(last_error)?;
        tcp.set_nodelay(true)?;
        let socket = tcp.try_clone()?;

        debug!(host = %endpoint.host, port = endpoint.port, tls = endpoint.tls, "TCP connected");

        let inner = if endpoint.tls {
            tcp.set_read_timeout(Some(timeout))?;
            tcp.set_write_timeout(Some(timeout))?;

            let name = ServerName::try_from(endpoint.host.clone())
                .map_err(|e| Error::tls(format!("invalid server name: {e}")))?;
            let conn = ClientConnection::new(tls_config()?, name)?;
            let mut tls = StreamOwned::new(conn, tcp);
            while tls.conn.is_handshaking() {
                tls.conn
                    .complete_io(&mut tls.sock)
                    .map_err(|e| Error::tls(format!("handshake failed: {e}")))?;
            }
            tls.sock.set_write_timeout(None)?;
            trace!(host = %endpoint.host, "TLS handshake completed");
            Inner::Tls(Arc::new(Mutex::new(tls)))
        } else {
            Inner::Plain(Arc::new(tcp))
        };

        Ok(Self { inner, socket })
    }

    /// Sets the read timeout of the underlying socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the socket rejects the option.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Splits into a reader and a shareable writer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the socket options cannot be updated.
    pub fn split(self) -> Result<(StreamReader, StreamWriter)> {
        let read_timeout = match self.inner {
            Inner::Plain(_) => None,
            Inner::Tls(_) => Some(TLS_POLL_INTERVAL),
        };
        self.socket.set_read_timeout(read_timeout)?;

        let closed = Arc::new(AtomicBool::new(false));
        let reader = StreamReader {
            inner: self.inner.clone(),
            closed: Arc::clone(&closed),
        };
        let writer = StreamWriter {
            inner: Mutex::new(self.inner),
            socket: self.socket,
            closed,
        };
        Ok((reader, writer))
    }

    /// Shuts the socket down in both directions.
    pub fn shutdown(&self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.inner {
            Inner::Plain(tcp) => (&**tcp).read(buf),
            Inner::Tls(tls) => tls.lock().read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.inner {
            Inner::Plain(tcp) => (&**tcp).write(buf),
            Inner::Tls(tls) => tls.lock().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &self.inner {
            Inner::Plain(tcp) => (&**tcp).flush(),
            Inner::Tls(tls) => tls.lock().flush(),
        }
    }
}

// ============================================================================
// StreamReader
// ============================================================================

/// Read half, owned by a single receive thread.
pub struct StreamReader {
    inner: Inner,
    closed: Arc<AtomicBool>,
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.inner {
            Inner::Plain(tcp) => (&**tcp).read(buf),
            Inner::Tls(tls) => loop {
                if self.closed.load(Ordering::Acquire) {
                    return Ok(0);
                }
                match tls.lock().read(buf) {
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                    other => return other,
                }
            },
        }
    }
}

// ============================================================================
// StreamWriter
// ============================================================================

/// Write half; writes are serialized by an internal lock.
pub struct StreamWriter {
    inner: Mutex<Inner>,
    socket: TcpStream,
    closed: Arc<AtomicBool>,
}

impl StreamWriter {
    /// Writes all of `bytes` as one unit and flushes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] after [`shutdown`](Self::shutdown),
    /// or [`Error::Io`] if the socket write fails.
    pub fn write_all(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let inner = self.inner.lock();
        match &*inner {
            Inner::Plain(tcp) => {
                let mut tcp = &**tcp;
                tcp.write_all(bytes)?;
                tcp.flush()?;
            }
            Inner::Tls(tls) => {
                let mut tls = tls.lock();
                tls.write_all(bytes)?;
                tls.flush()?;
            }
        }
        Ok(())
    }

    /// Returns `true` after [`shutdown`](Self::shutdown).
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shuts the socket down, unblocking the reader. Idempotent.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.socket.shutdown(Shutdown::Both);
        }
    }
}

// ============================================================================
// TLS Configuration
// ============================================================================

/// Returns the shared client TLS configuration.
fn tls_config() -> Result<Arc<ClientConfig>> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

    if let Some(config) = CONFIG.get() {
        return Ok(Arc::clone(config));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_platform_verifier()
        .with_no_client_auth();

    Ok(Arc::clone(CONFIG.get_or_init(|| Arc::new(config))))
}

/// Converts a duration to whole milliseconds, saturating.
#[inline]
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Tests
// ============================================================================
