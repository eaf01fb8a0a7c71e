//! Transport layer.
//!
//! A [`Backend`] carries packets to the service over one connection. It is
//! created by a [`Connector`] once a session is available, and reports
//! inbound traffic through an [`EventSink`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   send(Packet)   ┌──────────────┐   frames / HTTP   ┌─────────┐
//! │ Client loop  │ ───────────────► │   Backend    │ ◄───────────────► │ Service │
//! │              │ ◄─────────────── │ (WS or REST) │                   │         │
//! └──────────────┘   BackendEvent   └──────────────┘                   └─────────┘
//! ```
//!
//! The URL scheme selects the backend: `ws`/`wss` for the full-duplex
//! WebSocket backend, `http`/`https` for the request/response REST backend.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | WebSocket backend: receive thread, keepalive, close |
//! | `frame` | WebSocket frame encoding, masking, reassembly |
//! | `http` | HTTP/1.1 upgrade request and response head |
//! | `rest` | HTTP backend on `reqwest` |
//! | `stream` | TCP and TLS sockets |
//! | `websocket` | WebSocket opening handshake |

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket backend.
pub mod connection;

/// WebSocket framing.
pub mod frame;

/// HTTP/1.1 upgrade exchange.
pub mod http;

/// HTTP backend.
pub mod rest;

/// TCP and TLS sockets.
pub mod stream;

/// WebSocket opening handshake.
pub mod websocket;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::client::auth::{Credentials, Session};
use crate::error::{Error, Result};
use crate::protocol::{Packet, Value};

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::WsBackend;
pub use rest::RestBackend;

// ============================================================================
// Constants
// ============================================================================

/// `User-Agent` sent on every connection.
pub const USER_AGENT: &str = concat!("Frankly-SDK/", env!("CARGO_PKG_VERSION"), " (Rust)");

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "app-token";

// ============================================================================
// Types
// ============================================================================

/// Inbound traffic reported by a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// A decoded packet: a response or a push event.
    Packet(Packet),
    /// The connection ended.
    Closed {
        /// Close status code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Callback receiving backend events, invoked from transport threads.
pub type EventSink = Arc<dyn Fn(BackendEvent) + Send + Sync>;

/// Settings passed to a [`Connector`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Socket connect and handshake timeout.
    pub connect_timeout: Duration,
    /// Largest accepted inbound message.
    pub max_message_size: usize,
    /// Keepalive ping interval of the WebSocket backend.
    pub ping_interval: Duration,
}

// ============================================================================
// Backend
// ============================================================================

/// One open connection to the service.
pub trait Backend: Send + Sync {
    /// Transmits a packet. Responses arrive through the [`EventSink`].
    ///
    /// `timeout` bounds backends that complete each request separately.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the packet cannot be written.
    fn send(&self, packet: &Packet, timeout: Duration) -> Result<()>;

    /// Performs a blocking request and returns the response payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Request`] for error responses. Backends without
    /// blocking calls return [`Error::Protocol`].
    fn call(&self, packet: &Packet, timeout: Duration) -> Result<Value> {
        let _ = (packet, timeout);
        Err(Error::protocol("backend does not support blocking calls"))
    }

    /// Returns `true` until the connection is closed.
    fn is_open(&self) -> bool;

    /// Closes the connection. Idempotent.
    fn close(&self, code: u16, reason: &str);
}

// ============================================================================
// Connector
// ============================================================================

/// Factory opening a [`Backend`] for an authenticated session.
pub trait Connector: Send + Sync {
    /// Opens a backend to `url`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the connection cannot be established.
    fn connect(
        &self,
        url: &Url,
        session: &Session,
        options: &ConnectOptions,
        sink: EventSink,
    ) -> Result<Arc<dyn Backend>>;
}

/// Connector selecting the backend from the URL scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

impl Connector for DefaultConnector {
    fn connect(
        &self,
        url: &Url,
        session: &Session,
        options: &ConnectOptions,
        sink: EventSink,
    ) -> Result<Arc<dyn Backend>> {
        match url.scheme() {
            "ws" | "wss" => Ok(Arc::new(WsBackend::connect(url, session, options, sink)?)),
            "http" | "https" => Ok(Arc::new(RestBackend::new(url, session, options, sink)?)),
            other => Err(Error::config(format!("unsupported scheme '{other}'"))),
        }
    }
}

// ============================================================================
// Session Headers
// ============================================================================

/// Builds the headers identifying a session to the service.
#[must_use]
pub fn session_headers(session: &Session) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Accept".to_string(), "application/json".to_string()),
        ("User-Agent".to_string(), USER_AGENT.to_string()),
    ];

    match &session.credentials {
        Credentials::Cookies(cookies) => {
            if let Some(token) = cookies.get(SESSION_COOKIE) {
                headers.push(("Cookie".to_string(), format!("{SESSION_COOKIE}={token}")));
            }
        }
        Credentials::Keys {
            app_key,
            app_secret,
            user,
            role,
        } => {
            headers.push(("Frankly-App-Key".to_string(), app_key.clone()));
            headers.push(("Frankly-App-Secret".to_string(), app_secret.clone()));
            if let Some(user) = user {
                headers.push(("Frankly-App-User-Id".to_string(), user.to_string()));
            }
            if let Some(role) = role {
                headers.push(("Frankly-App-User-Role".to_string(), role.clone()));
            }
        }
    }

    headers
}

// ============================================================================
// Tests
// ============================================================================
