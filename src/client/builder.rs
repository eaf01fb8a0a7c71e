//! Builder pattern for client configuration.
//!
//! Provides a fluent API for configuring and creating [`Client`] instances.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use frankly_client::Client;
//!
//! # fn example() -> frankly_client::Result<()> {
//! let client = Client::builder()
//!     .url("wss://app.franklychat.com")
//!     .request_timeout(Duration::from_secs(10))
//!     .build()?;
//! client.open_with_keys("app-key", "app-secret", None, None)?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};
use crate::transport::{ConnectOptions, Connector, DefaultConnector};

use super::core::Client;

// ============================================================================
// Constants
// ============================================================================

/// Default socket connect and handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time allowed for a request, replays included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default largest accepted inbound message (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default keepalive ping interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

// ============================================================================
// Mode
// ============================================================================

/// How blocking the client's lifecycle calls are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// `close` waits for the background threads; key/secret clients on an
    /// HTTP address run without a background thread at all.
    #[default]
    Sync,
    /// `close` returns immediately and the background threads wind down on
    /// their own.
    Async,
}

// ============================================================================
// ClientConfig
// ============================================================================

/// Validated client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Service address.
    pub url: Url,
    /// Socket connect and handshake timeout.
    pub connect_timeout: Duration,
    /// Default request timeout.
    pub request_timeout: Duration,
    /// Lifecycle mode.
    pub mode: Mode,
    /// Largest accepted inbound message.
    pub max_message_size: usize,
    /// Keepalive ping interval.
    pub ping_interval: Duration,
    /// Backend factory.
    pub connector: Arc<dyn Connector>,
}

impl ClientConfig {
    /// Returns `true` for `http` and `https` addresses.
    #[inline]
    #[must_use]
    pub fn is_http(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }

    /// Returns the options handed to the connector.
    #[must_use]
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: self.connect_timeout,
            max_message_size: self.max_message_size,
            ping_interval: self.ping_interval,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url.as_str())
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("mode", &self.mode)
            .field("max_message_size", &self.max_message_size)
            .field("ping_interval", &self.ping_interval)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for configuring a [`Client`] instance.
///
/// Use [`Client::builder()`] to create a new builder.
#[derive(Clone)]
pub struct ClientBuilder {
    url: Option<String>,
    connect_timeout: Duration,
    request_timeout: Duration,
    mode: Mode,
    max_message_size: usize,
    ping_interval: Duration,
    connector: Option<Arc<dyn Connector>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            mode: Mode::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            ping_interval: DEFAULT_PING_INTERVAL,
            connector: None,
        }
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("url", &self.url)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("mode", &self.mode)
            .field("max_message_size", &self.max_message_size)
            .field("ping_interval", &self.ping_interval)
            .field("custom_connector", &self.connector.is_some())
            .finish()
    }
}

// ============================================================================
// ClientBuilder Implementation
// ============================================================================

impl ClientBuilder {
    /// Creates a builder with default settings and no URL.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the service address (`http`, `https`, `ws` or `wss`).
    #[inline]
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the socket connect and handshake timeout.
    #[inline]
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the default request timeout.
    #[inline]
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the lifecycle mode.
    #[inline]
    #[must_use]
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the largest accepted inbound message.
    #[inline]
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets the keepalive ping interval.
    #[inline]
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Replaces the backend factory.
    #[inline]
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Builds the client with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the URL is missing or uses another scheme, or a
    ///   timeout, interval or size is zero
    /// - [`Error::Url`] if the URL does not parse
    pub fn build(self) -> Result<Client> {
        let config = self.validate()?;
        Ok(Client::new(config))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ClientBuilder {
    fn validate(self) -> Result<ClientConfig> {
        let url = self.url.ok_or_else(|| {
            Error::config(
                "Service URL is required. Use .url() to set it.\n\
                 Example: Client::builder().url(\"wss://app.franklychat.com\")",
            )
        })?;
        let url = Url::parse(&url)?;

        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(Error::config(format!(
                "Unsupported URL scheme '{}'. Expected http, https, ws or wss.",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(Error::config(format!("URL '{url}' has no host")));
        }

        if self.connect_timeout.is_zero() {
            return Err(Error::config("connect_timeout must be positive"));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::config("request_timeout must be positive"));
        }
        if self.ping_interval.is_zero() {
            return Err(Error::config("ping_interval must be positive"));
        }
        if self.max_message_size == 0 {
            return Err(Error::config("max_message_size must be positive"));
        }

        Ok(ClientConfig {
            url,
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            mode: self.mode,
            max_message_size: self.max_message_size,
            ping_interval: self.ping_interval,
            connector: self.connector.unwrap_or_else(|| Arc::new(DefaultConnector)),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
