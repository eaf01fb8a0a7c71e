//! Client event bus.
//!
//! Lifecycle changes and push notifications are published as
//! [`ClientEvent`]s. Handlers subscribe per [`Topic`], either persistently or
//! for a single delivery, and run on the publishing thread with the registry
//! unlocked, so a handler may subscribe or unsubscribe freely.
//!
//! [`EventBus::stream`] turns the bus into a blocking iterator that ends
//! after the `close` event.
//!
//! # Topics
//!
//! | Topic | Published when |
//! |-------|----------------|
//! | `connect` | A backend is connected |
//! | `authenticate` | A session was obtained for the connection |
//! | `update` / `delete` | A push packet arrived |
//! | `disconnect` | A connected backend went away |
//! | `error` | Authentication, connection or send failed |
//! | `close` | The client closed |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{error, trace};

use crate::error::Error;
use crate::protocol::PushEvent;

use super::auth::Session;

// ============================================================================
// Topic
// ============================================================================

/// Event category handlers subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Backend connected.
    Connect,
    /// Backend disconnected.
    Disconnect,
    /// Session obtained.
    Authenticate,
    /// Resource updated by the server.
    Update,
    /// Resource deleted by the server.
    Delete,
    /// Recoverable failure.
    Error,
    /// Client closed.
    Close,
}

impl Topic {
    /// Every topic.
    pub const ALL: [Self; 7] = [
        Self::Connect,
        Self::Disconnect,
        Self::Authenticate,
        Self::Update,
        Self::Delete,
        Self::Error,
        Self::Close,
    ];

    /// Returns the event name.
    #[inline]
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Authenticate => "authenticate",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Error => "error",
            Self::Close => "close",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// ClientEvent
// ============================================================================

/// An event published by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Backend connected.
    Connect,
    /// Backend disconnected.
    Disconnect,
    /// Session obtained for the current connection.
    Authenticate(Session),
    /// Resource updated by the server.
    Update(PushEvent),
    /// Resource deleted by the server.
    Delete(PushEvent),
    /// Recoverable failure.
    Error(Error),
    /// Client closed.
    Close,
}

impl ClientEvent {
    /// Returns the topic this event is published on.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::Connect => Topic::Connect,
            Self::Disconnect => Topic::Disconnect,
            Self::Authenticate(_) => Topic::Authenticate,
            Self::Update(_) => Topic::Update,
            Self::Delete(_) => Topic::Delete,
            Self::Error(_) => Topic::Error,
            Self::Close => Topic::Close,
        }
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// Event handler callback.
pub type Handler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    topic: Topic,
    id: u64,
}

impl Subscription {
    /// Returns the subscribed topic.
    #[inline]
    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.topic
    }
}

struct Listener {
    id: u64,
    handler: Handler,
    once: bool,
}

#[derive(Default)]
struct Registry {
    listeners: Mutex<FxHashMap<Topic, Vec<Listener>>>,
    next_id: AtomicU64,
}

/// Publish/subscribe registry shared by a client and its handles.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.registry.listeners.lock();
        f.debug_struct("EventBus")
            .field("listeners", &listeners.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for every event on `topic`.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.register(topic, Arc::new(handler), false)
    }

    /// Registers `handler` for the next event on `topic` only.
    pub fn once<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.register(topic, Arc::new(handler), true)
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut listeners = self.registry.listeners.lock();
        let Some(list) = listeners.get_mut(&subscription.topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|l| l.id != subscription.id);
        before != list.len()
    }

    /// Returns the number of handlers registered on `topic`.
    #[must_use]
    pub fn listener_count(&self, topic: Topic) -> usize {
        self.registry
            .listeners
            .lock()
            .get(&topic)
            .map_or(0, Vec::len)
    }

    /// Delivers `event` to the handlers of its topic.
    ///
    /// One-shot handlers are removed before delivery. A panicking handler is
    /// logged and does not prevent the others from running.
    pub fn publish(&self, event: &ClientEvent) {
        let topic = event.topic();
        let handlers: Vec<Handler> = {
            let mut listeners = self.registry.listeners.lock();
            let Some(list) = listeners.get_mut(&topic) else {
                return;
            };
            let handlers = list.iter().map(|l| Arc::clone(&l.handler)).collect();
            list.retain(|l| !l.once);
            handlers
        };

        trace!(%topic, handlers = handlers.len(), "Publishing event");

        for handler in handlers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                error!(
                    %topic,
                    error = %Error::panicked(&*payload),
                    "Event handler panicked"
                );
            }
        }
    }

    /// Returns a blocking iterator over events that ends after `close`.
    #[must_use]
    pub fn stream(&self) -> EventStream {
        let (tx, rx) = channel::unbounded();
        let subscriptions = Topic::ALL
            .iter()
            .map(|&topic| {
                let tx = tx.clone();
                self.subscribe(topic, move |event| {
                    let _ = tx.send(event.clone());
                })
            })
            .collect();

        EventStream {
            bus: self.clone(),
            subscriptions,
            rx,
            done: false,
        }
    }

    fn register(&self, topic: Topic, handler: Handler, once: bool) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .listeners
            .lock()
            .entry(topic)
            .or_default()
            .push(Listener { id, handler, once });
        Subscription { topic, id }
    }
}

// ============================================================================
// EventStream
// ============================================================================

/// Iterator over client events, ending after the `close` event.
///
/// Dropping the stream unsubscribes it.
pub struct EventStream {
    bus: EventBus,
    subscriptions: Vec<Subscription>,
    rx: Receiver<ClientEvent>,
    done: bool,
}

impl EventStream {
    /// Waits up to `timeout` for the next event.
    ///
    /// Returns `None` on timeout or once the stream has ended.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<ClientEvent> {
        if self.done {
            return None;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(self.observe(event)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.done = true;
                None
            }
        }
    }

    fn observe(&mut self, event: ClientEvent) -> ClientEvent {
        if matches!(event, ClientEvent::Close) {
            self.done = true;
        }
        event
    }
}

impl Iterator for EventStream {
    type Item = ClientEvent;

    fn next(&mut self) -> Option<ClientEvent> {
        if self.done {
            return None;
        }
        match self.rx.recv() {
            Ok(event) => Some(self.observe(event)),
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            self.bus.unsubscribe(subscription);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
