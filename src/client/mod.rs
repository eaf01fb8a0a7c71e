//! Chat client.
//!
//! This module provides the main entry point: a [`Client`] that
//! authenticates, keeps one backend connection alive and multiplexes
//! requests over it.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Client`] | State machine, request multiplexer and reconnect loop |
//! | [`ClientBuilder`] | Fluent configuration builder |
//! | [`Request`] | A request with path, params, payload and timeout |
//! | [`EventBus`] | Listener registry for [`ClientEvent`]s |
//! | [`Authenticator`] | Source of [`Session`]s |
//! | [`RequestStore`] | Pending requests keyed by id |
//!
//! # Example
//!
//! ```no_run
//! use frankly_client::{Client, Request, Result, Topic};
//!
//! # fn example() -> Result<()> {
//! let client = Client::builder().url("wss://app.franklychat.com").build()?;
//! client.on(Topic::Update, |event| println!("{event:?}"));
//! client.open_with_keys("app-key", "app-secret", Some(42), None)?;
//!
//! let rooms = client.send(Request::read(["rooms"]).with_param("limit", 10))?;
//! println!("{rooms}");
//!
//! client.close(1000, "done");
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Session types and authenticators.
pub mod auth;

/// Fluent builder for client configuration.
pub mod builder;

/// Client state machine.
pub mod core;

/// Client events and listener registry.
pub mod events;

/// Pending request store.
pub mod store;

// ============================================================================
// Re-exports
// ============================================================================

pub use auth::{
    Authenticator, Credentials, IdentityTokenGenerator, KeyAuthenticator, Session,
    TokenAuthenticator, generate_identity_token, identity_token_generator,
};
pub use builder::{ClientBuilder, ClientConfig, Mode};
pub use core::{Client, Request, State};
pub use events::{ClientEvent, EventBus, EventStream, Subscription, Topic};
pub use store::{PendingRequest, RequestStore};
