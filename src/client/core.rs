//! Client state machine and request multiplexer.
//!
//! A [`Client`] owns at most one backend at a time. Requests are numbered,
//! stored until answered, and written to the backend by a background
//! worker. When the connection drops the worker authenticates again,
//! reconnects with exponential backoff and replays everything still
//! pending.
//!
//! # States
//!
//! ```text
//! Idle ─open─► Authenticating ─► Connecting ─► Connected
//!                    ▲                              │
//!                    └──────── Reconnecting ◄───────┘
//! any ─close─► Closing ─► Closed ─open─► Authenticating ...
//! ```
//!
//! # Dispatch Modes
//!
//! | Mode | When | Requests |
//! |------|------|----------|
//! | Direct | Pre-resolved credentials, HTTP address, [`Mode::Sync`] | Blocking call on the caller's thread |
//! | Background | Everything else | Queued, matched to responses by id |
//!
//! Every open or close bumps the client [`Epoch`]. Background threads
//! capture the epoch they were started for and exit once it changes.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{Epoch, RequestId};
use crate::protocol::{Kind, Packet, Params, PushEvent, Value};
use crate::runtime::{Future, JobQueue, Received, Timer, Worker};
use crate::transport::connection::DEFAULT_CLOSE_REASON;
use crate::transport::frame::CLOSE_GOING_AWAY;
use crate::transport::stream::duration_ms;
use crate::transport::{Backend, BackendEvent, EventSink};

use super::auth::{
    Authenticator, IdentityTokenGenerator, KeyAuthenticator, Session, TokenAuthenticator,
};
use super::builder::{ClientBuilder, ClientConfig, Mode};
use super::events::{ClientEvent, EventBus, EventStream, Subscription, Topic};
use super::store::RequestStore;

// ============================================================================
// Constants
// ============================================================================

/// Interval of the expired-request sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest reconnect delay after a failure.
pub const MIN_BACKOFF: Duration = Duration::from_secs(1);

/// Longest reconnect delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(15);

// ============================================================================
// State
// ============================================================================

/// Lifecycle state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    /// Never opened.
    #[default]
    Idle,
    /// Obtaining a session.
    Authenticating,
    /// Opening a backend.
    Connecting,
    /// Backend open; requests flow.
    Connected,
    /// Backend lost; waiting to reconnect.
    Reconnecting,
    /// Close in progress.
    Closing,
    /// Closed; may be opened again.
    Closed,
}

impl State {
    /// Returns `true` between `open` and `close`.
    #[inline]
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(
            self,
            Self::Authenticating | Self::Connecting | Self::Connected | Self::Reconnecting
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Authenticating => "authenticating",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Request
// ============================================================================

/// A request to submit through a [`Client`].
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Operation.
    pub kind: Kind,
    /// Target path segments.
    pub path: Vec<String>,
    /// Query modifiers.
    pub params: Params,
    /// Body.
    pub payload: Value,
    /// Time allowed for this request; only extends the client default.
    pub timeout: Option<Duration>,
}

impl Request {
    /// Creates a request with no params, a nil payload and the default timeout.
    #[must_use]
    pub fn new<I, S>(kind: Kind, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            path: path.into_iter().map(Into::into).collect(),
            params: Params::new(),
            payload: Value::Nil,
            timeout: None,
        }
    }

    /// Creates a `READ` request.
    #[must_use]
    pub fn read<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Kind::Read, path)
    }

    /// Creates a `CREATE` request.
    #[must_use]
    pub fn create<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Kind::Create, path)
    }

    /// Creates an `UPDATE` request.
    #[must_use]
    pub fn update<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Kind::Update, path)
    }

    /// Creates a `DELETE` request.
    #[must_use]
    pub fn delete<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Kind::Delete, path)
    }

    /// Replaces the params.
    #[inline]
    #[must_use]
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Adds one param.
    #[inline]
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Sets the payload.
    #[inline]
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Sets a longer timeout for this request.
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn into_packet(self, id: RequestId) -> Packet {
        Packet::new(self.kind, self.path)
            .with_id(id)
            .with_params(self.params)
            .with_payload(self.payload)
    }
}

// ============================================================================
// Internal Types
// ============================================================================

/// Work item of the background worker.
///
/// Backend events carry the number of the connection that produced them;
/// the job loop ignores events of earlier connections.
#[derive(Debug)]
enum ClientJob {
    /// Transmit the pending request with this id.
    Send(RequestId),
    /// Inbound packet from the backend.
    Packet { link: u64, packet: Packet },
    /// The backend connection ended.
    Closed { link: u64, code: u16, reason: String },
}

/// Why the job loop of one connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// The worker was stopped or the epoch changed.
    Stopped,
    /// The connection was lost or a send failed.
    Lost,
    /// The service rejected the session.
    Reauthenticate,
}

enum Dispatcher {
    /// A direct-mode open is authenticating and connecting.
    Opening,
    Direct(Arc<dyn Backend>),
    Background {
        worker: Worker<ClientJob>,
        timer: Timer,
    },
}

/// A request accepted by the client, before its result is awaited.
enum Submitted {
    Direct {
        backend: Arc<dyn Backend>,
        packet: Packet,
        timeout: Duration,
    },
    Queued {
        id: RequestId,
        future: Future<Value>,
        timeout: Duration,
    },
}

#[derive(Default)]
struct Shared {
    state: State,
    epoch: Epoch,
    store: RequestStore,
    last_id: RequestId,
    dispatcher: Option<Dispatcher>,
    close_request: Option<(u16, String)>,
}

struct ClientInner {
    config: ClientConfig,
    events: EventBus,
    shared: Mutex<Shared>,
}

// ============================================================================
// Client
// ============================================================================

/// Connection to the chat service.
///
/// All methods take `&self`; share a client across threads with an
/// [`Arc`]. Dropping an open client closes it without waiting.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("Client")
            .field("url", &self.inner.config.url.as_str())
            .field("state", &shared.state)
            .field("epoch", &shared.epoch)
            .field("pending", &shared.store.len())
            .finish()
    }
}

impl Client {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                events: EventBus::new(),
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the event bus.
    #[inline]
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.inner.shared.lock().state
    }

    /// Returns the current epoch.
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.inner.shared.lock().epoch
    }

    /// Returns `true` between `open` and `close`.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(
            self.inner.shared.lock().dispatcher,
            Some(Dispatcher::Direct(_) | Dispatcher::Background { .. })
        )
    }

    /// Returns the number of requests waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.shared.lock().store.len()
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Registers `handler` for every event on `topic`.
    pub fn on<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(topic, handler)
    }

    /// Registers `handler` for the next event on `topic`.
    pub fn once<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.events.once(topic, handler)
    }

    /// Removes a subscription.
    pub fn off(&self, subscription: Subscription) -> bool {
        self.inner.events.unsubscribe(subscription)
    }

    /// Returns an iterator over events that ends after `close`.
    #[must_use]
    pub fn stream(&self) -> EventStream {
        self.inner.events.stream()
    }

    // ========================================================================
    // Open
    // ========================================================================

    /// Opens with a fixed app key and secret.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_with_keys(
        &self,
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        user: Option<u64>,
        role: Option<String>,
    ) -> Result<()> {
        self.open(KeyAuthenticator::new(app_key, app_secret, user, role))
    }

    /// Opens with the nonce and identity-token exchange.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_with_identity_token_generator(&self, generator: IdentityTokenGenerator) -> Result<()> {
        let authenticator =
            TokenAuthenticator::new(&self.inner.config.url, generator, self.inner.config.connect_timeout)?;
        self.open(authenticator)
    }

    /// Opens the client.
    ///
    /// A pre-resolved authenticator on an HTTP address in [`Mode::Sync`]
    /// connects on the calling thread and publishes `connect` and
    /// `authenticate` before returning. Otherwise a background worker
    /// authenticates and connects, and keeps reconnecting until `close`.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyOpen`] if the client is open or opening
    /// - Any authentication or connection error in direct mode
    /// - [`Error::NotOpen`] if the client was closed during a direct open
    /// - [`Error::Io`] if a background thread cannot be spawned
    pub fn open<A>(&self, authenticator: A) -> Result<()>
    where
        A: Authenticator + 'static,
    {
        let authenticator: Arc<dyn Authenticator> = Arc::new(authenticator);
        let config = &self.inner.config;
        let direct = authenticator.is_preresolved() && config.mode == Mode::Sync && config.is_http();

        let mut shared = self.inner.shared.lock();
        if shared.dispatcher.is_some() {
            return Err(Error::AlreadyOpen);
        }
        shared.epoch = shared.epoch.next();
        shared.close_request = None;
        let epoch = shared.epoch;

        if direct {
            shared.state = State::Authenticating;
            shared.dispatcher = Some(Dispatcher::Opening);
            drop(shared);

            // The lock is released while connecting so callbacks and other
            // threads can query or close the client meanwhile.
            let opened = authenticator.authenticate().and_then(|session| {
                self.inner.transition(epoch, State::Connecting);
                let sink: EventSink =
                    Arc::new(|event: BackendEvent| trace!(?event, "Ignoring backend event"));
                let backend =
                    config
                        .connector
                        .connect(&config.url, &session, &config.connect_options(), sink)?;
                Ok((session, backend))
            });

            let mut shared = self.inner.shared.lock();
            if shared.epoch != epoch {
                drop(shared);
                debug!(%epoch, "Client closed while opening");
                if let Ok((_, backend)) = &opened {
                    backend.close(CLOSE_GOING_AWAY, DEFAULT_CLOSE_REASON);
                }
                return Err(Error::NotOpen);
            }
            let (session, backend) = match opened {
                Ok(opened) => opened,
                Err(e) => {
                    shared.state = State::Closed;
                    shared.dispatcher = None;
                    return Err(e);
                }
            };
            shared.state = State::Connected;
            shared.dispatcher = Some(Dispatcher::Direct(backend));
            drop(shared);

            debug!(url = %config.url, %epoch, "Client opened in direct mode");
            self.inner.events.publish(&ClientEvent::Connect);
            self.inner.events.publish(&ClientEvent::Authenticate(session));
            return Ok(());
        }

        let worker = {
            let inner = Arc::clone(&self.inner);
            Worker::<ClientJob>::spawn_with("frankly-client", move |queue, _| {
                inner.run(&queue, &*authenticator, epoch);
            })?
        };
        let timer = {
            let inner = Arc::clone(&self.inner);
            Timer::start("frankly-sweep", SWEEP_INTERVAL, move || {
                inner.sweep(Instant::now());
            })
        };
        let timer = match timer {
            Ok(timer) => timer,
            Err(e) => {
                shared.epoch = shared.epoch.next();
                worker.stop();
                return Err(e);
            }
        };

        shared.state = State::Authenticating;
        shared.dispatcher = Some(Dispatcher::Background { worker, timer });
        debug!(url = %config.url, %epoch, "Client opened");
        Ok(())
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Submits a request and returns a future for its response.
    ///
    /// # Errors
    ///
    /// - [`Error::NotOpen`] if the client is not open
    /// - [`Error::Protocol`] if request ids are exhausted
    pub fn submit(&self, request: Request) -> Result<Future<Value>> {
        match self.enqueue(request)? {
            Submitted::Direct {
                backend,
                packet,
                timeout,
            } => Ok(Future::spawn(move || backend.call(&packet, timeout))),
            Submitted::Queued { future, .. } => Ok(future),
        }
    }

    /// Submits a request and blocks for its response.
    ///
    /// # Errors
    ///
    /// - [`Error::Request`] if the service answered with an error
    /// - [`Error::RequestTimeout`] if no response arrived in time
    /// - [`Error::Canceled`] if the client closed meanwhile
    /// - [`Error::NotOpen`] if the client is not open
    pub fn send(&self, request: Request) -> Result<Value> {
        match self.enqueue(request)? {
            Submitted::Direct {
                backend,
                packet,
                timeout,
            } => backend.call(&packet, timeout),
            Submitted::Queued {
                id,
                future,
                timeout,
            } => match future.wait(timeout + SWEEP_INTERVAL) {
                Err(Error::WaitTimeout { .. }) => {
                    let request = self.inner.shared.lock().store.load(id);
                    let error = match &request {
                        Some(request) => request.timeout_error(),
                        None => Error::request_timeout(id, "request", "", duration_ms(timeout)),
                    };
                    if let Some(request) = request {
                        request.reject(error.clone());
                    }
                    // A response may have won the race against the removal.
                    future.try_result().unwrap_or(Err(error))
                }
                result => result,
            },
        }
    }

    /// Sends a request built from its parts and blocks for the response.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn request<I, S>(&self, kind: Kind, path: I, params: Params, payload: Value) -> Result<Value>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(
            Request::new(kind, path)
                .with_params(params)
                .with_payload(payload),
        )
    }

    /// Reads a resource.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn read<I, S>(&self, path: I) -> Result<Value>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Request::read(path))
    }

    /// Creates a resource.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn create<I, S>(&self, path: I, payload: impl Into<Value>) -> Result<Value>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Request::create(path).with_payload(payload))
    }

    /// Updates a resource.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn update<I, S>(&self, path: I, payload: impl Into<Value>) -> Result<Value>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Request::update(path).with_payload(payload))
    }

    /// Deletes a resource.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn delete<I, S>(&self, path: I) -> Result<Value>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Request::delete(path))
    }

    fn enqueue(&self, request: Request) -> Result<Submitted> {
        let default = self.inner.config.request_timeout;
        let timeout = request.timeout.map_or(default, |t| t.max(default));

        let mut guard = self.inner.shared.lock();
        let shared = &mut *guard;
        if shared.dispatcher.is_none() {
            return Err(Error::NotOpen);
        }
        let id = shared
            .last_id
            .checked_next()
            .ok_or_else(|| Error::protocol("request ids exhausted"))?;
        shared.last_id = id;
        let packet = request.into_packet(id);

        match &shared.dispatcher {
            Some(Dispatcher::Direct(backend)) => Ok(Submitted::Direct {
                backend: Arc::clone(backend),
                packet,
                timeout,
            }),
            Some(Dispatcher::Background { worker, .. }) => {
                let future = Future::new();
                trace!(%id, path = %packet.path_string(), "Request queued");
                // Stored before scheduling so the worker always finds it.
                shared
                    .store
                    .store(packet, Instant::now() + timeout, future.clone());
                if let Err(e) = worker.schedule(ClientJob::Send(id)) {
                    shared.store.load(id);
                    return Err(e);
                }
                Ok(Submitted::Queued {
                    id,
                    future,
                    timeout,
                })
            }
            Some(Dispatcher::Opening) | None => Err(Error::NotOpen),
        }
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Closes the client and waits for its background threads.
    ///
    /// Pending requests are rejected with [`Error::Canceled`] and `close` is
    /// published. Does nothing if the client is not open.
    pub fn close(&self, code: u16, reason: &str) {
        let wait = self.inner.config.mode == Mode::Sync;
        self.close_with(code, reason, wait);
    }

    /// Closes the client without waiting for its background threads.
    pub fn close_async(&self, code: u16, reason: &str) {
        self.close_with(code, reason, false);
    }

    fn close_with(&self, code: u16, reason: &str, wait: bool) {
        let (dispatcher, canceled, epoch) = {
            let mut shared = self.inner.shared.lock();
            let Some(dispatcher) = shared.dispatcher.take() else {
                return;
            };
            shared.state = State::Closing;
            shared.epoch = shared.epoch.next();
            shared.close_request = Some((code, reason.to_string()));
            if let Dispatcher::Background { worker, timer } = &dispatcher {
                timer.stop();
                worker.stop();
            }
            (dispatcher, shared.store.take_all(), shared.epoch)
        };

        debug!(code, reason, %epoch, "Closing client");

        match dispatcher {
            Dispatcher::Opening => {}
            Dispatcher::Direct(backend) => {
                backend.close(code, reason);
                self.inner.events.publish(&ClientEvent::Disconnect);
            }
            Dispatcher::Background { worker, timer } => {
                if wait {
                    timer.join();
                    worker.join();
                }
            }
        }

        for request in &canceled {
            request.reject(request.cancel_error());
        }
        if !canceled.is_empty() {
            debug!(count = canceled.len(), "Canceled pending requests");
        }

        {
            let mut shared = self.inner.shared.lock();
            if shared.epoch == epoch {
                shared.state = State::Closed;
            }
        }
        self.inner.events.publish(&ClientEvent::Close);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close_with(CLOSE_GOING_AWAY, DEFAULT_CLOSE_REASON, false);
    }
}

// ============================================================================
// Background Loop
// ============================================================================

impl ClientInner {
    /// Moves to `state` if `epoch` is still current.
    fn transition(&self, epoch: Epoch, state: State) -> bool {
        let mut shared = self.shared.lock();
        if shared.epoch != epoch {
            return false;
        }
        if shared.state != state {
            trace!(from = %shared.state, to = %state, "Client state changed");
            shared.state = state;
        }
        true
    }

    /// Authenticates, connects and serves until the epoch changes.
    fn run(&self, queue: &Arc<JobQueue<ClientJob>>, authenticator: &dyn Authenticator, epoch: Epoch) {
        let mut delay = Duration::ZERO;
        let mut link = 0;

        loop {
            if !delay.is_zero() {
                debug!(delay_ms = duration_ms(delay), "Waiting before reconnecting");
                if !backoff_wait(queue, delay) {
                    break;
                }
            }

            if !self.transition(epoch, State::Authenticating) {
                break;
            }
            let session = match authenticator.authenticate() {
                Ok(session) => session,
                Err(e) => {
                    delay = next_delay(delay);
                    warn!(error = %e, "Authentication failed");
                    self.events.publish(&ClientEvent::Error(e));
                    continue;
                }
            };
            debug!(%session, "Authenticated");

            if !self.transition(epoch, State::Connecting) {
                break;
            }
            link += 1;
            let backend = match self.connect(queue, &session, link) {
                Ok(backend) => backend,
                Err(e) => {
                    delay = next_delay(delay);
                    warn!(error = %e, "Connection failed");
                    self.events.publish(&ClientEvent::Error(e));
                    continue;
                }
            };
            delay = Duration::ZERO;

            {
                let mut shared = self.shared.lock();
                if shared.epoch != epoch {
                    drop(shared);
                    backend.close(CLOSE_GOING_AWAY, DEFAULT_CLOSE_REASON);
                    break;
                }
                // Sends queued during the reconnect are folded into the
                // replay so requests go out in id order.
                let backlog = queue.drain();
                let ids = shared.store.ids();
                let events = backlog
                    .into_iter()
                    .filter(|job| !matches!(job, ClientJob::Send(_)));
                for job in ids.iter().map(|id| ClientJob::Send(*id)).chain(events) {
                    // Fails only once stopped; the job loop then exits.
                    let _ = queue.push(job);
                }
                shared.state = State::Connected;
                if !ids.is_empty() {
                    debug!(count = ids.len(), "Replaying pending requests");
                }
            }

            self.events.publish(&ClientEvent::Connect);
            self.events.publish(&ClientEvent::Authenticate(session.clone()));

            let outcome = self.serve(queue, &*backend, &session, epoch, link);

            if backend.is_open() {
                let (code, reason) = match outcome {
                    Outcome::Stopped => self.shared.lock().close_request.clone(),
                    Outcome::Lost | Outcome::Reauthenticate => None,
                }
                .unwrap_or_else(|| (CLOSE_GOING_AWAY, DEFAULT_CLOSE_REASON.to_string()));
                backend.close(code, &reason);
            }
            self.events.publish(&ClientEvent::Disconnect);

            match outcome {
                Outcome::Stopped => break,
                Outcome::Lost => delay = next_delay(delay),
                Outcome::Reauthenticate => debug!("Session rejected, authenticating again"),
            }

            queue.clear();
            if !self.transition(epoch, State::Reconnecting) {
                break;
            }
        }

        debug!(%epoch, "Client loop exited");
    }

    fn connect(
        &self,
        queue: &Arc<JobQueue<ClientJob>>,
        session: &Session,
        link: u64,
    ) -> Result<Arc<dyn Backend>> {
        let queue = Arc::clone(queue);
        let sink: EventSink = Arc::new(move |event: BackendEvent| {
            let job = match event {
                BackendEvent::Packet(packet) => ClientJob::Packet { link, packet },
                BackendEvent::Closed { code, reason } => ClientJob::Closed { link, code, reason },
            };
            if queue.push(job).is_err() {
                trace!("Dropping backend event after stop");
            }
        });

        let config = &self.config;
        config
            .connector
            .connect(&config.url, session, &config.connect_options(), sink)
    }

    /// Processes jobs for one connection.
    fn serve(
        &self,
        queue: &JobQueue<ClientJob>,
        backend: &dyn Backend,
        session: &Session,
        epoch: Epoch,
        link: u64,
    ) -> Outcome {
        // Ids already written on this connection; replays may queue a
        // second send job for a request submitted during the connect.
        let mut transmitted = FxHashSet::default();

        while let Some(job) = queue.recv() {
            match job {
                ClientJob::Send(id) => {
                    if !transmitted.insert(id) {
                        continue;
                    }
                    let next = {
                        let mut shared = self.shared.lock();
                        if shared.epoch != epoch {
                            return Outcome::Stopped;
                        }
                        let timeout = shared.store.get(id).map(|request| request.timeout);
                        shared.store.packet_for_send(id, session.seed).zip(timeout)
                    };
                    let Some((packet, timeout)) = next else {
                        continue;
                    };

                    trace!(%packet, "Sending request");
                    if let Err(e) = backend.send(&packet, timeout) {
                        error!(%id, error = %e, "Failed to send request");
                        let request = self.shared.lock().store.load(id);
                        if let Some(request) = request {
                            request.reject(e.clone());
                        }
                        self.events.publish(&ClientEvent::Error(e));
                        return Outcome::Lost;
                    }
                }
                ClientJob::Packet { link: from, packet } if from != link => {
                    trace!(%packet, link = from, "Dropping packet of an earlier connection");
                }
                ClientJob::Closed { link: from, .. } if from != link => {}
                ClientJob::Packet { packet, .. } => {
                    if self.dispatch(packet) {
                        return Outcome::Reauthenticate;
                    }
                }
                ClientJob::Closed { code, reason, .. } => {
                    debug!(code, reason = %reason, "Backend closed");
                    return Outcome::Lost;
                }
            }

            if !backend.is_open() {
                return Outcome::Lost;
            }
        }

        Outcome::Stopped
    }

    /// Routes an inbound packet; returns `true` if the session was rejected.
    fn dispatch(&self, packet: Packet) -> bool {
        if packet.is_push() {
            match packet.kind {
                Kind::Update => {
                    let event = PushEvent::from_packet(&packet);
                    trace!(resource = %event.resource, "Push update");
                    self.events.publish(&ClientEvent::Update(event));
                }
                Kind::Delete => {
                    let event = PushEvent::from_packet(&packet);
                    trace!(resource = %event.resource, "Push delete");
                    self.events.publish(&ClientEvent::Delete(event));
                }
                _ => debug!(%packet, "Ignoring push packet"),
            }
            return false;
        }

        let id = packet.id;
        let request = self.shared.lock().store.load(id);
        let Some(request) = request else {
            warn!(%id, "Response for unknown request");
            return false;
        };

        trace!(%id, kind = packet.operation(), "Response received");
        match packet.into_result(request.packet.kind) {
            Ok(value) => {
                if request.future.resolve(value).is_err() {
                    trace!(%id, "Request already completed");
                }
                false
            }
            Err(e) => {
                let unauthorized = e.is_unauthorized();
                request.reject(e);
                unauthorized
            }
        }
    }

    /// Rejects every request whose deadline has passed.
    fn sweep(&self, now: Instant) {
        let expired = self.shared.lock().store.take_expired(now);
        for request in &expired {
            debug!(id = %request.packet.id, "Request timed out");
            request.reject(request.timeout_error());
        }
    }
}

/// Doubles the delay within the backoff bounds.
fn next_delay(delay: Duration) -> Duration {
    (delay * 2).clamp(MIN_BACKOFF, MAX_BACKOFF)
}

/// Waits `delay`, discarding jobs; returns `false` once the queue stops.
///
/// Discarded send jobs are replayed from the store after reconnecting.
fn backoff_wait(queue: &JobQueue<ClientJob>, delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        match queue.recv_deadline(deadline) {
            Received::Job(job) => trace!(?job, "Discarding job while disconnected"),
            Received::Timeout => return true,
            Received::Stopped => return false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::thread;

    use crossbeam::channel::{self, Receiver, Sender};
    use url::Url;

    use crate::protocol::Resource;
    use crate::transport::{ConnectOptions, Connector};

    const WAIT: Duration = Duration::from_secs(5);

    // ------------------------------------------------------------------------
    // Mock transport
    // ------------------------------------------------------------------------

    struct MockBackend {
        sink: EventSink,
        open: AtomicBool,
        sent_tx: Sender<Packet>,
        sent: Receiver<Packet>,
        closed_with: Mutex<Option<(u16, String)>>,
    }

    impl MockBackend {
        fn new(sink: EventSink) -> Self {
            let (sent_tx, sent) = channel::unbounded();
            Self {
                sink,
                open: AtomicBool::new(true),
                sent_tx,
                sent,
                closed_with: Mutex::new(None),
            }
        }

        fn next_sent(&self) -> Packet {
            self.sent.recv_timeout(WAIT).expect("sent packet")
        }

        fn deliver(&self, packet: Packet) {
            (self.sink)(BackendEvent::Packet(packet));
        }

        fn drop_connection(&self) {
            self.open.store(false, Ordering::SeqCst);
            (self.sink)(BackendEvent::Closed {
                code: 1006,
                reason: "gone".to_string(),
            });
        }
    }

    impl Backend for MockBackend {
        fn send(&self, packet: &Packet, _timeout: Duration) -> Result<()> {
            if !self.is_open() {
                return Err(Error::ConnectionClosed);
            }
            let _ = self.sent_tx.send(packet.clone());
            Ok(())
        }

        fn call(&self, packet: &Packet, _timeout: Duration) -> Result<Value> {
            if packet.path.first().is_some_and(|s| s == "missing") {
                return Err(Error::request(packet.operation(), packet.path_string(), 404, "missing"));
            }
            Ok(Value::from(packet.path_string()))
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn close(&self, code: u16, reason: &str) {
            self.open.store(false, Ordering::SeqCst);
            self.closed_with.lock().get_or_insert((code, reason.to_string()));
        }
    }

    struct MockConnector {
        backends: Sender<Arc<MockBackend>>,
        connects: AtomicUsize,
    }

    impl Connector for MockConnector {
        fn connect(
            &self,
            _url: &Url,
            _session: &Session,
            _options: &ConnectOptions,
            sink: EventSink,
        ) -> Result<Arc<dyn Backend>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let backend = Arc::new(MockBackend::new(sink));
            let _ = self.backends.send(Arc::clone(&backend));
            Ok(backend)
        }
    }

    /// Holds every connect after the first until released.
    struct GatedConnector {
        inner: MockConnector,
        waiting: Sender<()>,
        release: Receiver<()>,
    }

    impl Connector for GatedConnector {
        fn connect(
            &self,
            url: &Url,
            session: &Session,
            options: &ConnectOptions,
            sink: EventSink,
        ) -> Result<Arc<dyn Backend>> {
            if self.inner.connects.load(Ordering::SeqCst) > 0 {
                let _ = self.waiting.send(());
                let _ = self.release.recv_timeout(WAIT);
            }
            self.inner.connect(url, session, options, sink)
        }
    }

    /// Key session that inspects the client while it authenticates.
    struct ReentrantAuthenticator {
        client: Arc<OnceLock<Arc<Client>>>,
        seen: Sender<(State, bool, bool)>,
        close: bool,
    }

    impl Authenticator for ReentrantAuthenticator {
        fn authenticate(&self) -> Result<Session> {
            if let Some(client) = self.client.get() {
                let rejected = matches!(client.read(["rooms"]), Err(Error::NotOpen));
                let _ = self.seen.send((client.state(), client.is_open(), rejected));
                if self.close {
                    client.close_async(1000, "abort");
                }
            }
            Ok(Session::with_keys("key", "secret", None, None))
        }

        fn is_preresolved(&self) -> bool {
            true
        }
    }

    /// Cookie sessions with seeds 7, 8, 9...; fails the first `failures` calls.
    struct SeedAuthenticator {
        next_seed: AtomicU64,
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl SeedAuthenticator {
        fn new(failures: usize) -> Self {
            Self {
                next_seed: AtomicU64::new(7),
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Authenticator for Arc<SeedAuthenticator> {
        fn authenticate(&self) -> Result<Session> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::connection("auth service unavailable"));
            }
            let seed = self.next_seed.fetch_add(1, Ordering::SeqCst);
            let mut cookies = std::collections::BTreeMap::new();
            cookies.insert("app-token".to_string(), format!("token-{seed}"));
            Ok(Session::with_cookies(cookies, seed, serde_json::json!({ "seed": seed })))
        }
    }

    fn mock_client(
        url: &str,
        mode: Mode,
        request_timeout: Duration,
    ) -> (Client, Receiver<Arc<MockBackend>>, Arc<MockConnector>) {
        let (tx, rx) = channel::unbounded();
        let connector = Arc::new(MockConnector {
            backends: tx,
            connects: AtomicUsize::new(0),
        });
        let client = Client::builder()
            .url(url)
            .mode(mode)
            .request_timeout(request_timeout)
            .connector(Arc::clone(&connector) as Arc<dyn Connector>)
            .build()
            .expect("client");
        (client, rx, connector)
    }

    fn topics(stream: &mut EventStream, count: usize) -> Vec<Topic> {
        (0..count)
            .map(|_| stream.next_timeout(WAIT).expect("event").topic())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    #[test]
    fn test_next_delay() {
        assert_eq!(next_delay(Duration::ZERO), Duration::from_secs(1));
        assert_eq!(next_delay(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(next_delay(Duration::from_secs(8)), Duration::from_secs(15));
        assert_eq!(next_delay(Duration::from_secs(15)), Duration::from_secs(15));
    }

    #[test]
    fn test_request_builder() {
        let request = Request::create(["rooms"])
            .with_param("limit", 10)
            .with_payload("hi")
            .with_timeout(Duration::from_secs(30));
        let packet = request.clone().into_packet(RequestId::new(4));

        assert_eq!(packet.kind, Kind::Create);
        assert_eq!(packet.id, RequestId::new(4));
        assert_eq!(packet.seed, 0);
        assert_eq!(packet.params.get("limit"), Some(&Value::from(10)));
        assert_eq!(packet.payload, Value::from("hi"));
        assert_eq!(request.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(State::Reconnecting.to_string(), "reconnecting");
        assert!(State::Connected.is_open());
        assert!(!State::Closed.is_open());
        assert!(!State::Idle.is_open());
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    #[test]
    fn test_not_open_and_already_open() {
        let (client, backends, _) = mock_client("ws://chat.test", Mode::Sync, Duration::from_secs(5));
        assert!(matches!(client.read(["rooms"]), Err(Error::NotOpen)));
        assert_eq!(client.state(), State::Idle);

        let auth = Arc::new(SeedAuthenticator::new(0));
        client.open(Arc::clone(&auth)).expect("open");
        assert!(matches!(client.open(Arc::clone(&auth)), Err(Error::AlreadyOpen)));
        backends.recv_timeout(WAIT).expect("backend");

        let first_epoch = client.epoch();
        client.close(1000, "done");
        client.close(1000, "done");
        assert_eq!(client.state(), State::Closed);
        assert!(!client.is_open());
        assert!(client.epoch() > first_epoch);

        client.open(auth).expect("reopen");
        backends.recv_timeout(WAIT).expect("backend");
        assert!(client.is_open());
        client.close(1000, "done");
    }

    #[test]
    fn test_events_for_connection_lifecycle() {
        let (client, backends, _) = mock_client("ws://chat.test", Mode::Sync, Duration::from_secs(5));
        let mut stream = client.stream();

        client.open(Arc::new(SeedAuthenticator::new(0))).expect("open");
        let backend = backends.recv_timeout(WAIT).expect("backend");
        assert_eq!(topics(&mut stream, 2), vec![Topic::Connect, Topic::Authenticate]);

        client.close(4000, "bye");
        assert_eq!(topics(&mut stream, 2), vec![Topic::Disconnect, Topic::Close]);
        assert!(stream.next_timeout(Duration::from_millis(50)).is_none());
        assert_eq!(*backend.closed_with.lock(), Some((4000, "bye".to_string())));
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    #[test]
    fn test_request_resolved_by_response() {
        let (client, backends, _) = mock_client("wss://chat.test", Mode::Sync, Duration::from_secs(5));
        client.open(Arc::new(SeedAuthenticator::new(0))).expect("open");
        let backend = backends.recv_timeout(WAIT).expect("backend");

        let responder = {
            let backend = Arc::clone(&backend);
            thread::spawn(move || {
                let packet = backend.next_sent();
                backend.deliver(Packet::ok_response(&packet, Value::from("pong")));
                packet
            })
        };

        let value = client.read(["ping"]).expect("response");
        assert_eq!(value, Value::from("pong"));

        let packet = responder.join().expect("responder");
        assert_eq!(packet.id, RequestId::FIRST);
        assert_eq!(packet.seed, 0);
        assert_eq!(packet.path, vec!["ping".to_string()]);
        assert_eq!(client.pending_count(), 0);
        client.close(1000, "");
    }

    #[test]
    fn test_ids_increase_per_request() {
        let (client, backends, _) = mock_client("ws://chat.test", Mode::Sync, Duration::from_secs(5));
        client.open(Arc::new(SeedAuthenticator::new(0))).expect("open");
        let backend = backends.recv_timeout(WAIT).expect("backend");

        let futures: Vec<_> = (0..3)
            .map(|i| client.submit(Request::read(vec!["rooms".to_string(), i.to_string()])).expect("submit"))
            .collect();
        let ids: Vec<u64> = (0..3).map(|_| backend.next_sent().id.as_u64()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(client.pending_count(), 3);

        client.close(1000, "");
        for future in futures {
            assert!(future.wait(WAIT).unwrap_err().is_canceled());
        }
    }

    #[test]
    fn test_error_response_rejects_request() {
        let (client, backends, _) = mock_client("ws://chat.test", Mode::Sync, Duration::from_secs(5));
        client.open(Arc::new(SeedAuthenticator::new(0))).expect("open");
        let backend = backends.recv_timeout(WAIT).expect("backend");

        let future = client.submit(Request::delete(["rooms", "9"])).expect("submit");
        let packet = backend.next_sent();
        backend.deliver(Packet::error_response(&packet, 404, "no such room"));

        match future.wait(WAIT).unwrap_err() {
            Error::Request {
                operation,
                path,
                status,
                reason,
            } => {
                assert_eq!(operation, "delete");
                assert_eq!(path, "/rooms/9");
                assert_eq!(status, 404);
                assert_eq!(reason, "no such room");
            }
            other => panic!("unexpected error {other:?}"),
        }
        client.close(1000, "");
    }

    #[test]
    fn test_unknown_response_is_ignored() {
        let (client, backends, _) = mock_client("ws://chat.test", Mode::Sync, Duration::from_secs(5));
        client.open(Arc::new(SeedAuthenticator::new(0))).expect("open");
        let backend = backends.recv_timeout(WAIT).expect("backend");

        let stray = Packet::new(Kind::Read, ["rooms"]).with_id(RequestId::new(99));
        backend.deliver(Packet::ok_response(&stray, Value::Nil));

        let future = client.submit(Request::read(["rooms"])).expect("submit");
        let packet = backend.next_sent();
        backend.deliver(Packet::ok_response(&packet, Value::from(1)));
        assert_eq!(future.wait(WAIT).expect("value"), Value::from(1));
        client.close(1000, "");
    }

    #[test]
    fn test_request_timeout() {
        let (client, backends, _) = mock_client("ws://chat.test", Mode::Sync, Duration::from_millis(300));
        client.open(Arc::new(SeedAuthenticator::new(0))).expect("open");
        let backend = backends.recv_timeout(WAIT).expect("backend");

        let future = client.submit(Request::read(["slow"])).expect("submit");
        backend.next_sent();

        let err = future.wait(WAIT).unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { .. }), "{err:?}");
        assert_eq!(err.status(), Some(crate::error::STATUS_TIMEOUT));
        assert_eq!(client.pending_count(), 0);
        client.close(1000, "");
    }

    #[test]
    fn test_close_cancels_pending_requests() {
        let (client, backends, _) = mock_client("ws://chat.test", Mode::Sync, Duration::from_secs(10));
        client.open(Arc::new(SeedAuthenticator::new(0))).expect("open");
        let backend = backends.recv_timeout(WAIT).expect("backend");

        let future = client.submit(Request::read(["slow"])).expect("submit");
        backend.next_sent();
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        client.close(1000, "");
        let err = future.wait(WAIT).unwrap_err();
        assert!(err.is_canceled(), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(client.submit(Request::read(["x"])), Err(Error::NotOpen)));
    }

    #[test]
    fn test_close_async_returns_immediately() {
        let (client, backends, _) = mock_client("ws://chat.test", Mode::Async, Duration::from_secs(10));
        client.open(Arc::new(SeedAuthenticator::new(0))).expect("open");
        backends.recv_timeout(WAIT).expect("backend");

        let future = client.submit(Request::read(["slow"])).expect("submit");
        client.close_async(1000, "");
        assert!(future.wait(WAIT).unwrap_err().is_canceled());
        assert_eq!(client.state(), State::Closed);
    }

    // ------------------------------------------------------------------------
    // Reconnect
    // ------------------------------------------------------------------------

    #[test]
    fn test_reconnect_replays_with_session_seed() {
        let (client, backends, connector) = mock_client("ws://chat.test", Mode::Sync, Duration::from_secs(10));
        let auth = Arc::new(SeedAuthenticator::new(0));
        client.open(Arc::clone(&auth)).expect("open");

        let first = backends.recv_timeout(WAIT).expect("first backend");
        let future = client.submit(Request::create(["rooms"]).with_payload("lobby")).expect("submit");

        let sent = first.next_sent();
        assert_eq!(sent.id, RequestId::FIRST);
        assert_eq!(sent.seed, 0);

        first.drop_connection();

        let second = backends.recv_timeout(WAIT).expect("second backend");
        let replay = second.next_sent();
        assert_eq!(replay.id, RequestId::FIRST);
        assert_eq!(replay.seed, 8);
        assert_eq!(replay.payload, Value::from("lobby"));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        // A response arriving late on the dropped connection is ignored.
        first.deliver(Packet::ok_response(&sent, Value::from("stale")));
        second.deliver(Packet::ok_response(&replay, Value::from("created")));
        assert_eq!(future.wait(WAIT).expect("value"), Value::from("created"));
        assert_eq!(client.pending_count(), 0);
        client.close(1000, "");
    }

    #[test]
    fn test_requests_queued_during_reconnect_follow_replay() {
        let (backend_tx, backends) = channel::unbounded();
        let (waiting_tx, waiting) = channel::unbounded();
        let (release_tx, release) = channel::unbounded();
        let connector = GatedConnector {
            inner: MockConnector {
                backends: backend_tx,
                connects: AtomicUsize::new(0),
            },
            waiting: waiting_tx,
            release,
        };
        let client = Client::builder()
            .url("ws://chat.test")
            .mode(Mode::Sync)
            .request_timeout(Duration::from_secs(10))
            .connector(Arc::new(connector) as Arc<dyn Connector>)
            .build()
            .expect("client");
        client.open(Arc::new(SeedAuthenticator::new(0))).expect("open");

        let first = backends.recv_timeout(WAIT).expect("first backend");
        let early = client.submit(Request::read(["rooms", "1"])).expect("submit");
        assert_eq!(first.next_sent().id, RequestId::FIRST);

        first.drop_connection();
        waiting.recv_timeout(WAIT).expect("reconnect started");
        let late = client.submit(Request::read(["rooms", "2"])).expect("submit");
        release_tx.send(()).expect("release");

        let second = backends.recv_timeout(WAIT).expect("second backend");
        let replayed = second.next_sent();
        let queued = second.next_sent();
        assert_eq!(replayed.id, RequestId::FIRST);
        assert_eq!(replayed.seed, 8);
        assert_eq!(queued.id, RequestId::new(2));
        assert_eq!(queued.seed, 0);
        assert!(second.sent.recv_timeout(Duration::from_millis(200)).is_err());

        second.deliver(Packet::ok_response(&replayed, Value::from("one")));
        second.deliver(Packet::ok_response(&queued, Value::from("two")));
        assert_eq!(early.wait(WAIT).expect("early"), Value::from("one"));
        assert_eq!(late.wait(WAIT).expect("late"), Value::from("two"));
        client.close(1000, "");
    }

    #[test]
    fn test_unauthorized_forces_reauthentication() {
        let (client, backends, _) = mock_client("ws://chat.test", Mode::Sync, Duration::from_secs(10));
        let auth = Arc::new(SeedAuthenticator::new(0));
        client.open(Arc::clone(&auth)).expect("open");
        let first = backends.recv_timeout(WAIT).expect("first backend");

        let future = client.submit(Request::read(["session"])).expect("submit");
        let packet = first.next_sent();
        first.deliver(Packet::error_response(&packet, 401, "session expired"));

        assert!(future.wait(WAIT).unwrap_err().is_unauthorized());
        // No backoff after a rejected session.
        backends
            .recv_timeout(Duration::from_millis(900))
            .expect("second backend");
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
        assert!(!first.is_open());
        client.close(1000, "");
    }

    #[test]
    fn test_authentication_failure_retries() {
        let (client, backends, _) = mock_client("ws://chat.test", Mode::Sync, Duration::from_secs(5));
        let mut stream = client.stream();
        let auth = Arc::new(SeedAuthenticator::new(1));
        client.open(Arc::clone(&auth)).expect("open");

        match stream.next_timeout(WAIT).expect("error event") {
            ClientEvent::Error(e) => assert!(e.is_connection_error()),
            other => panic!("unexpected event {other:?}"),
        }
        backends.recv_timeout(WAIT).expect("backend");
        assert_eq!(topics(&mut stream, 2), vec![Topic::Connect, Topic::Authenticate]);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
        client.close(1000, "");
    }

    // ------------------------------------------------------------------------
    // Push events
    // ------------------------------------------------------------------------

    #[test]
    fn test_push_packets_published() {
        let (client, backends, _) = mock_client("ws://chat.test", Mode::Sync, Duration::from_secs(5));
        client.open(Arc::new(SeedAuthenticator::new(0))).expect("open");
        let backend = backends.recv_timeout(WAIT).expect("backend");

        let (tx, rx) = channel::unbounded();
        let updates = tx.clone();
        client.on(Topic::Update, move |event| {
            let _ = updates.send(event.clone());
        });
        client.on(Topic::Delete, move |event| {
            let _ = tx.send(event.clone());
        });

        backend.deliver(
            Packet::new(Kind::Update, ["rooms", "1", "messages", "5"]).with_payload("hello"),
        );
        backend.deliver(Packet::new(Kind::Delete, ["users", "3"]));
        backend.deliver(Packet::new(Kind::Read, ["rooms"]));

        match rx.recv_timeout(WAIT).expect("update") {
            ClientEvent::Update(event) => {
                assert_eq!(event.resource, Resource::RoomMessage);
                assert_eq!(event.room_id, Some(1));
                assert_eq!(event.payload, Value::from("hello"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv_timeout(WAIT).expect("delete") {
            ClientEvent::Delete(event) => {
                assert_eq!(event.resource, Resource::User);
                assert!(event.is_delete());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        client.close(1000, "");
    }

    // ------------------------------------------------------------------------
    // Direct mode
    // ------------------------------------------------------------------------

    #[test]
    fn test_direct_mode() {
        let (client, backends, _) = mock_client("https://chat.test", Mode::Sync, Duration::from_secs(5));
        let mut stream = client.stream();

        client.open_with_keys("key", "secret", Some(1), None).expect("open");
        assert_eq!(client.state(), State::Connected);
        assert_eq!(topics(&mut stream, 2), vec![Topic::Connect, Topic::Authenticate]);
        let backend = backends.try_recv().expect("backend created on open");

        assert_eq!(client.read(["rooms", "1"]).expect("value"), Value::from("/rooms/1"));
        let err = client.read(["missing"]).unwrap_err();
        assert_eq!(err.status(), Some(404));

        let future = client.submit(Request::read(["apps", "2"])).expect("submit");
        assert_eq!(future.wait(WAIT).expect("value"), Value::from("/apps/2"));
        assert_eq!(client.pending_count(), 0);

        client.close(1000, "done");
        assert_eq!(topics(&mut stream, 2), vec![Topic::Disconnect, Topic::Close]);
        assert_eq!(*backend.closed_with.lock(), Some((1000, "done".to_string())));
    }

    /// Builds a direct-mode client that `authenticator` can reach.
    fn shared_direct_client() -> (Arc<Client>, Arc<OnceLock<Arc<Client>>>, Receiver<Arc<MockBackend>>) {
        let (client, backends, _) = mock_client("https://chat.test", Mode::Sync, Duration::from_secs(5));
        let client = Arc::new(client);
        let slot = Arc::new(OnceLock::new());
        let _ = slot.set(Arc::clone(&client));
        (client, slot, backends)
    }

    #[test]
    fn test_direct_open_releases_lock_while_authenticating() {
        let (client, slot, backends) = shared_direct_client();
        let (seen_tx, seen) = channel::unbounded();
        let authenticator = ReentrantAuthenticator {
            client: slot,
            seen: seen_tx,
            close: false,
        };

        // Open on another thread so a held lock fails the test instead of
        // hanging it.
        let (done_tx, done) = channel::bounded(1);
        {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                let _ = done_tx.send(client.open(authenticator));
            });
        }

        let (state, open, rejected) = seen.recv_timeout(WAIT).expect("client observed");
        assert_eq!(state, State::Authenticating);
        assert!(!open);
        assert!(rejected);
        done.recv_timeout(WAIT).expect("open returned").expect("open");

        assert_eq!(client.state(), State::Connected);
        assert!(client.is_open());
        backends.try_recv().expect("backend");
        assert!(matches!(
            client.open_with_keys("key", "secret", None, None),
            Err(Error::AlreadyOpen)
        ));
        client.close(1000, "done");
    }

    #[test]
    fn test_close_during_direct_open() {
        let (client, slot, backends) = shared_direct_client();
        let (seen_tx, _seen) = channel::unbounded();
        let authenticator = ReentrantAuthenticator {
            client: slot,
            seen: seen_tx,
            close: true,
        };
        let mut stream = client.stream();

        let (done_tx, done) = channel::bounded(1);
        {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                let _ = done_tx.send(client.open(authenticator));
            });
        }

        let result = done.recv_timeout(WAIT).expect("open returned");
        assert!(matches!(result, Err(Error::NotOpen)));
        assert_eq!(client.state(), State::Closed);
        assert!(!client.is_open());
        assert_eq!(topics(&mut stream, 1), vec![Topic::Close]);

        let backend = backends.try_recv().expect("backend");
        assert!(!backend.is_open());
        assert!(backend.closed_with.lock().is_some());
    }

    #[test]
    fn test_async_mode_on_http_uses_background_worker() {
        let (client, backends, _) = mock_client("http://chat.test", Mode::Async, Duration::from_secs(5));
        client.open_with_keys("key", "secret", None, None).expect("open");
        let backend = backends.recv_timeout(WAIT).expect("backend");

        let future = client.submit(Request::read(["rooms"])).expect("submit");
        let packet = backend.next_sent();
        backend.deliver(Packet::ok_response(&packet, Value::from(true)));
        assert_eq!(future.wait(WAIT).expect("value"), Value::from(true));
        client.close(1000, "");
    }
}
