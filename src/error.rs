//! Error types for the Frankly client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use frankly_client::{Client, Result};
//!
//! fn example(client: &Client) -> Result<()> {
//!     let session = client.read(["session"])?;
//!     println!("{session}");
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::AlreadyOpen`], [`Error::NotOpen`] |
//! | Wire | [`Error::Decode`], [`Error::Encode`] |
//! | Transport | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`], [`Error::Upgrade`], [`Error::Protocol`], [`Error::Tls`] |
//! | Request | [`Error::Request`], [`Error::RequestTimeout`], [`Error::Canceled`] |
//! | Runtime | [`Error::WaitTimeout`], [`Error::AlreadyResolved`], [`Error::WorkerStopped`], [`Error::Panicked`] |
//! | External | [`Error::Io`], [`Error::Http`], [`Error::Json`], [`Error::Url`], [`Error::Token`] |
//!
//! [`Error`] is `Clone` so a single rejection can be delivered to every
//! continuation registered on a [`Future`](crate::runtime::Future). External
//! error sources are shared behind an [`Arc`].

// ============================================================================
// Imports
// ============================================================================

use std::io::{Error as IoError, ErrorKind};
use std::result::Result as StdResult;
use std::sync::Arc;

use thiserror::Error;

use crate::identifiers::RequestId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Status Codes
// ============================================================================

/// Status reported for requests whose deadline passed.
pub const STATUS_TIMEOUT: u16 = 408;

/// Status reported for requests canceled by a closing client.
pub const STATUS_CANCELED: u16 = 500;

/// Status that forces the client to re-authenticate.
pub const STATUS_UNAUTHORIZED: u16 = 401;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// The client was opened while already open.
    #[error("Client is already open")]
    AlreadyOpen,

    /// An operation required an open client.
    #[error("Client is not open")]
    NotOpen,

    // ========================================================================
    // Wire Errors
    // ========================================================================
    /// Malformed packet bytes.
    ///
    /// Local to the transport: logged and dropped, never used to reject a request.
    #[error("Decode error: {message}")]
    Decode {
        /// Description of the malformed input.
        message: String,
    },

    /// A value could not be encoded for the wire.
    #[error("Encode error: {message}")]
    Encode {
        /// Description of the encoding failure.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Connection failed.
    ///
    /// Returned when a socket cannot be established or breaks mid-use.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection timeout.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed while in use.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The WebSocket upgrade was refused or answered incorrectly.
    #[error("WebSocket upgrade failed: {message}")]
    Upgrade {
        /// Description of the upgrade failure.
        message: String,
    },

    /// WebSocket protocol violation.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// TLS setup or handshake failure.
    #[error("TLS error: {message}")]
    Tls {
        /// Description of the TLS failure.
        message: String,
    },

    // ========================================================================
    // Request Errors
    // ========================================================================
    /// The server answered a request with a non-OK status.
    #[error("[{status}] {reason} ({operation} {path})")]
    Request {
        /// Operation name (`read`, `create`, `update`, `delete`, `auth`).
        operation: String,
        /// Slash-joined request path.
        path: String,
        /// Status reported by the server.
        status: u16,
        /// Reason reported by the server.
        reason: String,
    },

    /// The request deadline passed before a response arrived.
    #[error("Request {request_id} timed out after {timeout_ms}ms ({operation} {path})")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Operation name.
        operation: String,
        /// Slash-joined request path.
        path: String,
        /// Milliseconds allowed for the request.
        timeout_ms: u64,
    },

    /// The client closed while the request was pending.
    #[error("Request {request_id} canceled ({operation} {path})")]
    Canceled {
        /// The request ID that was canceled.
        request_id: RequestId,
        /// Operation name.
        operation: String,
        /// Slash-joined request path.
        path: String,
    },

    // ========================================================================
    // Runtime Errors
    // ========================================================================
    /// `Future::wait` gave up before the future was resolved.
    #[error("Wait timed out after {timeout_ms}ms")]
    WaitTimeout {
        /// Milliseconds waited.
        timeout_ms: u64,
    },

    /// A future was resolved or rejected a second time.
    #[error("Future already resolved")]
    AlreadyResolved,

    /// A job was scheduled on a stopped worker.
    #[error("Worker stopped")]
    WorkerStopped,

    /// A job panicked while computing a result.
    #[error("Job panicked: {message}")]
    Panicked {
        /// Panic payload, when it was a string.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(Arc<IoError>),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(Arc<reqwest::Error>),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// URL parse error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Identity token generation error.
    #[error("Token error: {0}")]
    Token(Arc<jsonwebtoken::errors::Error>),
}

// ============================================================================
// Conversions
// ============================================================================

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Token(Arc::new(err))
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Self::Tls {
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a decode error.
    #[inline]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates an encode error.
    #[inline]
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates an upgrade error.
    #[inline]
    pub fn upgrade(message: impl Into<String>) -> Self {
        Self::Upgrade {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a TLS error.
    #[inline]
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Creates a request error from a server status.
    #[inline]
    pub fn request(
        operation: impl Into<String>,
        path: impl Into<String>,
        status: u16,
        reason: impl Into<String>,
    ) -> Self {
        Self::Request {
            operation: operation.into(),
            path: path.into(),
            status,
            reason: reason.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(
        request_id: RequestId,
        operation: impl Into<String>,
        path: impl Into<String>,
        timeout_ms: u64,
    ) -> Self {
        Self::RequestTimeout {
            request_id,
            operation: operation.into(),
            path: path.into(),
            timeout_ms,
        }
    }

    /// Creates a cancellation error.
    #[inline]
    pub fn canceled(
        request_id: RequestId,
        operation: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self::Canceled {
            request_id,
            operation: operation.into(),
            path: path.into(),
        }
    }

    /// Creates a wait timeout error.
    #[inline]
    pub fn wait_timeout(timeout_ms: u64) -> Self {
        Self::WaitTimeout { timeout_ms }
    }

    /// Creates a panic error from a panic payload.
    pub fn panicked(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panicked { message }
    }
}

// ============================================================================
// Error Accessors
// ============================================================================

impl Error {
    /// Returns the request status associated with this error, if any.
    ///
    /// Timeouts report 408 and cancellations 500.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request { status, .. } => Some(*status),
            Self::RequestTimeout { .. } => Some(STATUS_TIMEOUT),
            Self::Canceled { .. } => Some(STATUS_CANCELED),
            _ => None,
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::RequestTimeout { .. } | Self::WaitTimeout { .. }
        ) || matches!(self, Self::Io(err) if err.kind() == ErrorKind::TimedOut)
            || matches!(self, Self::Http(err) if err.is_timeout())
    }

    /// Returns `true` if the request was canceled by a closing client.
    #[inline]
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    /// Returns `true` if the server demanded re-authentication.
    #[inline]
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Request { status, .. } if *status == STATUS_UNAUTHORIZED)
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::Upgrade { .. }
                | Self::Protocol { .. }
                | Self::Tls { .. }
                | Self::Io(_)
                | Self::Http(_)
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.is_connection_error()
            || matches!(
                self,
                Self::RequestTimeout { .. } | Self::WaitTimeout { .. }
            )
            || self.is_unauthorized()
    }
}

// ============================================================================
// Tests
// ============================================================================
