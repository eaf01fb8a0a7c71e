//! Packet and packet kind types.
//!
//! A [`Packet`] is a single protocol message: a request sent by the client,
//! a response correlated by [`RequestId`], or a server push event (id `0`).
//!
//! # Kinds
//!
//! | Value | Request side | Response side |
//! |-------|--------------|---------------|
//! | 0 | `READ` | `OK` |
//! | 1 | `CREATE` | `ERROR` |
//! | 2 | `UPDATE` | |
//! | 3 | `DELETE` | |

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// Types
// ============================================================================

/// Opaque, recursively-encodable payload value.
pub type Value = rmpv::Value;

/// Query-string-like request modifiers.
pub type Params = BTreeMap<String, Value>;

// ============================================================================
// Kind
// ============================================================================

/// Packet kind, stored in the low three bits of the packet flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    /// Read a resource. Shares its value with [`Kind::OK`].
    Read = 0,
    /// Create a resource. Shares its value with [`Kind::ERROR`].
    Create = 1,
    /// Update a resource.
    Update = 2,
    /// Delete a resource.
    Delete = 3,
}

impl Kind {
    /// Successful response.
    pub const OK: Self = Self::Read;

    /// Failed response.
    pub const ERROR: Self = Self::Create;

    /// Returns the operation name used in logs and errors.
    #[inline]
    #[must_use]
    pub const fn operation(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Returns the HTTP method carrying this kind over the HTTP transport.
    #[inline]
    #[must_use]
    pub const fn http_method(self) -> &'static str {
        match self {
            Self::Read => "GET",
            Self::Create => "POST",
            Self::Update => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl TryFrom<u8> for Kind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Read),
            1 => Ok(Self::Create),
            2 => Ok(Self::Update),
            3 => Ok(Self::Delete),
            other => Err(Error::decode(format!("unknown packet kind {other}"))),
        }
    }
}

impl From<Kind> for u8 {
    fn from(kind: Kind) -> Self {
        kind as u8
    }
}

// ============================================================================
// Packet
// ============================================================================

/// A single protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Request operation or response status.
    pub kind: Kind,
    /// Replay marker; `0` disables duplicate detection.
    pub seed: u64,
    /// Correlation id; `0` for push events.
    pub id: RequestId,
    /// Target resource path segments.
    pub path: Vec<String>,
    /// Query-string-like modifiers.
    pub params: Params,
    /// Request or response body.
    pub payload: Value,
}

impl Packet {
    /// Creates an uncorrelated packet with empty params and a nil payload.
    #[must_use]
    pub fn new<I, S>(kind: Kind, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            seed: 0,
            id: RequestId::NONE,
            path: path.into_iter().map(Into::into).collect(),
            params: Params::new(),
            payload: Value::Nil,
        }
    }

    /// Sets the correlation id.
    #[inline]
    #[must_use]
    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }

    /// Sets the replay seed.
    #[inline]
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the params.
    #[inline]
    #[must_use]
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Sets the payload.
    #[inline]
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Builds the `OK` response to `request` carrying `payload`.
    #[must_use]
    pub fn ok_response(request: &Packet, payload: Value) -> Self {
        Self {
            kind: Kind::OK,
            seed: request.seed,
            id: request.id,
            path: request.path.clone(),
            params: request.params.clone(),
            payload,
        }
    }

    /// Builds the `ERROR` response to `request` with a status and reason.
    #[must_use]
    pub fn error_response(request: &Packet, status: u16, reason: &str) -> Self {
        let payload = Value::Map(vec![
            (Value::from("status"), Value::from(status)),
            (Value::from("error"), Value::from(reason)),
        ]);
        Self {
            kind: Kind::ERROR,
            ..Self::ok_response(request, payload)
        }
    }

    /// Returns `true` if this packet is not correlated to a request.
    #[inline]
    #[must_use]
    pub fn is_push(&self) -> bool {
        self.id.is_none()
    }

    /// Returns the operation name of the packet kind.
    #[inline]
    #[must_use]
    pub fn operation(&self) -> &'static str {
        self.kind.operation()
    }

    /// Returns the slash-joined path, `/` when empty.
    #[must_use]
    pub fn path_string(&self) -> String {
        format!("/{}", self.path.join("/"))
    }

    /// Extracts `(status, reason)` from an `ERROR` response payload.
    ///
    /// Missing fields default to status 500 and an empty reason.
    #[must_use]
    pub fn error_status(&self) -> (u16, String) {
        let status = map_get(&self.payload, "status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(500);
        let reason = match map_get(&self.payload, "error") {
            Some(Value::String(s)) => s.as_str().unwrap_or_default().to_string(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        (status, reason)
    }

    /// Converts a response packet into the caller-facing result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Request`] for `ERROR` responses.
    pub fn into_result(self, request_kind: Kind) -> Result<Value> {
        if self.kind == Kind::OK {
            return Ok(self.payload);
        }
        let (status, reason) = self.error_status();
        Err(Error::request(
            request_kind.operation(),
            self.path_string(),
            status,
            reason,
        ))
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload = match &self.payload {
            Value::Nil => "null",
            Value::Map(_) => "{ ... }",
            Value::Array(_) => "[ ... ]",
            _ => "scalar",
        };
        write!(
            f,
            "packet {{ kind = {}, seed = {}, id = {}, path = {}, params = {}, payload = {} }}",
            self.operation(),
            self.seed,
            self.id,
            self.path_string(),
            self.params.len(),
            payload,
        )
    }
}

/// Looks up a string key in a map value.
pub(crate) fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

// ============================================================================
// Tests
// ============================================================================
