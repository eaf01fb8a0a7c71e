//! Pending request store.
//!
//! Every request waiting for a response lives here, keyed by its id, until
//! a response arrives, its deadline passes or the client closes. Ids are
//! kept ordered so replays after a reconnect go out in request order.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::Error;
use crate::identifiers::RequestId;
use crate::protocol::{Packet, Value};
use crate::runtime::Future;
use crate::transport::stream::duration_ms;

// ============================================================================
// PendingRequest
// ============================================================================

/// A request waiting for its response.
#[derive(Debug)]
pub struct PendingRequest {
    /// Packet as stored; its seed is set once the request has been sent.
    pub packet: Packet,
    /// Deadline after which the request is rejected.
    pub expire: Instant,
    /// Time allowed when the request was stored.
    pub timeout: Duration,
    /// Future completed with the response.
    pub future: Future<Value>,
    /// Whether the request has been transmitted at least once.
    pub sent: bool,
}

impl PendingRequest {
    /// Builds the timeout error for this request.
    #[must_use]
    pub fn timeout_error(&self) -> Error {
        Error::request_timeout(
            self.packet.id,
            self.packet.operation(),
            self.packet.path_string(),
            duration_ms(self.timeout),
        )
    }

    /// Builds the cancellation error for this request.
    #[must_use]
    pub fn cancel_error(&self) -> Error {
        Error::canceled(self.packet.id, self.packet.operation(), self.packet.path_string())
    }

    /// Rejects the future, ignoring an already completed one.
    pub fn reject(&self, error: Error) {
        if self.future.reject(error).is_err() {
            trace!(id = %self.packet.id, "Request already completed");
        }
    }
}

// ============================================================================
// RequestStore
// ============================================================================

/// Pending requests ordered by id.
#[derive(Debug, Default)]
pub struct RequestStore {
    pending: BTreeMap<RequestId, PendingRequest>,
}

impl RequestStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a request until `expire`.
    ///
    /// A pending request with the same id is replaced and returned.
    pub fn store(&mut self, packet: Packet, expire: Instant, future: Future<Value>) -> Option<PendingRequest> {
        let id = packet.id;
        let timeout = expire.saturating_duration_since(Instant::now());
        self.pending.insert(
            id,
            PendingRequest {
                packet,
                expire,
                timeout,
                future,
                sent: false,
            },
        )
    }

    /// Removes and returns the request with `id`.
    pub fn load(&mut self, id: RequestId) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    /// Returns the request with `id` without removing it.
    #[inline]
    #[must_use]
    pub fn get(&self, id: RequestId) -> Option<&PendingRequest> {
        self.pending.get(&id)
    }

    /// Returns `true` if a request with `id` is pending.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Returns the number of pending requests.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if nothing is pending.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns the pending ids in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<RequestId> {
        self.pending.keys().copied().collect()
    }

    /// Returns the packet to transmit for `id` and marks the request sent.
    ///
    /// The first transmission goes out with seed 0 and stamps the stored
    /// packet with `seed`. Later transmissions are replays and carry the
    /// current `seed` so the service can discard duplicates.
    pub fn packet_for_send(&mut self, id: RequestId, seed: u64) -> Option<Packet> {
        let request = self.pending.get_mut(&id)?;
        request.packet.seed = seed;
        let mut packet = request.packet.clone();
        if !request.sent {
            request.sent = true;
            packet.seed = 0;
        }
        Some(packet)
    }

    /// Removes and returns every request whose deadline is at or before `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingRequest> {
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, request)| request.expire <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    /// Removes and returns every pending request.
    pub fn take_all(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    /// Rejects expired requests with a timeout error; returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired = self.take_expired(now);
        for request in &expired {
            request.reject(request.timeout_error());
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired pending requests");
        }
        expired.len()
    }

    /// Rejects every request with a cancellation error; returns how many.
    pub fn cancel(&mut self) -> usize {
        let canceled = self.take_all();
        for request in &canceled {
            request.reject(request.cancel_error());
        }
        if !canceled.is_empty() {
            debug!(count = canceled.len(), "Canceled pending requests");
        }
        canceled.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
