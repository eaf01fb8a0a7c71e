//! Frankly client - Client engine for the Frankly real-time chat platform.
//!
//! This library talks to the chat service over a MessagePack protocol,
//! either on a WebSocket or as plain HTTP requests, and keeps the
//! connection alive on its own.
//!
//! # Architecture
//!
//! The client follows a worker model on plain OS threads:
//!
//! - **Caller threads**: submit requests and wait on [`Future`]s
//! - **Client worker**: authenticates, connects, writes requests, matches
//!   responses by id and reconnects with backoff
//! - **Receive thread**: decodes frames from the socket and hands packets
//!   to the client worker
//!
//! Key design principles:
//!
//! - Each request carries a unique id; responses are correlated by it
//! - Pending requests survive reconnects and are replayed with the new
//!   session seed
//! - Every open and close starts a new epoch; stale threads exit on their own
//! - Server pushes surface as `update` and `delete` events
//!
//! # Quick Start
//!
//! ```no_run
//! use frankly_client::{Client, Result};
//!
//! fn main() -> Result<()> {
//!     let client = Client::builder()
//!         .url("wss://app.franklychat.com")
//!         .build()?;
//!
//!     client.open_with_keys("app-key", "app-secret", Some(1), None)?;
//!
//!     let room = client.create(["rooms"], "lobby")?;
//!     println!("created {room}");
//!
//!     client.close(1000, "bye");
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`Client`], builder, authentication and events |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Request ids and client epochs |
//! | [`protocol`] | Packets, codec and push classification |
//! | [`runtime`] | Futures, workers, pools and timers |
//! | [`transport`] | WebSocket and HTTP backends |

// ============================================================================
// Modules
// ============================================================================

/// Client state machine, configuration, authentication and events.
///
/// Use [`Client::builder()`] to create a configured client.
pub mod client;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Wire protocol packets and their binary encoding.
pub mod protocol;

/// Thread-based concurrency primitives.
pub mod runtime;

/// Transport layer.
///
/// WebSocket and HTTP backends behind the [`transport::Backend`] trait.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{
    Authenticator, Client, ClientBuilder, ClientConfig, ClientEvent, Credentials, EventBus,
    EventStream, KeyAuthenticator, Mode, Request, Session, State, Subscription, TokenAuthenticator,
    Topic, generate_identity_token, identity_token_generator,
};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{Epoch, RequestId};

// Protocol types
pub use protocol::{Kind, Packet, Params, PushEvent, Resource, Value};

// Runtime types
pub use runtime::{Future, Timer, Worker, WorkerPool};
