//! HTTP backend.
//!
//! Each packet becomes one HTTP request: the kind selects the method, the
//! path is appended to the service address, params become the query string
//! and a non-nil payload is sent as a JSON body. Requests go through a
//! blocking [`reqwest`] client that carries the session headers.
//!
//! [`call`](Backend::call) blocks for the response. [`send`](Backend::send)
//! runs the same exchange on the global worker pool and reports an `OK` or
//! `ERROR` response packet through the [`EventSink`], which lets the client
//! drive both backends with the same request store.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::Method;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, trace};
use url::Url;

use crate::client::auth::Session;
use crate::error::{Error, Result, STATUS_CANCELED};
use crate::protocol::packet::map_get;
use crate::protocol::{Kind, Packet, Value};
use crate::runtime::WorkerPool;

use super::{Backend, BackendEvent, ConnectOptions, EventSink, session_headers};

// ============================================================================
// RestBackend
// ============================================================================

/// Request/response backend over HTTP(S).
pub struct RestBackend {
    inner: Arc<Inner>,
}

struct Inner {
    http: HttpClient,
    origin: String,
    base_path: String,
    sink: EventSink,
    open: AtomicBool,
}

impl RestBackend {
    /// Creates a backend for the service at `url`.
    ///
    /// No connection is made until the first request.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the URL has no host or a session header is
    ///   not a valid header value
    /// - [`Error::Http`] if the HTTP client cannot be built
    pub fn new(
        url: &Url,
        session: &Session,
        options: &ConnectOptions,
        sink: EventSink,
    ) -> Result<Self> {
        if url.host_str().is_none() {
            return Err(Error::config(format!("URL '{url}' has no host")));
        }
        let origin = url.origin().ascii_serialization();
        let base_path = url.path().trim_end_matches('/').to_string();

        let http = HttpClient::builder()
            .default_headers(header_map(&session_headers(session))?)
            .connect_timeout(options.connect_timeout)
            .no_proxy()
            .build()?;

        debug!(url = %url, "HTTP backend opened");

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                origin,
                base_path,
                sink,
                open: AtomicBool::new(true),
            }),
        })
    }
}

impl Backend for RestBackend {
    fn send(&self, packet: &Packet, timeout: Duration) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        let inner = Arc::clone(&self.inner);
        let request = packet.clone();
        WorkerPool::global()?.schedule(move || {
            let response = match inner.exchange(&request, timeout) {
                Ok(payload) => Packet::ok_response(&request, payload),
                Err(e) => {
                    let (status, reason) = error_status(&e);
                    Packet::error_response(&request, status, &reason)
                }
            };
            if inner.open.load(Ordering::Acquire) {
                (inner.sink)(BackendEvent::Packet(response));
            } else {
                trace!(id = %request.id, "Dropping response after close");
            }
        })
    }

    fn call(&self, packet: &Packet, timeout: Duration) -> Result<Value> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        self.inner.exchange(packet, timeout)
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    fn close(&self, code: u16, reason: &str) {
        if self.inner.open.swap(false, Ordering::AcqRel) {
            debug!(code, reason, "HTTP backend closed");
        }
    }
}

// ============================================================================
// Exchange
// ============================================================================

impl Inner {
    /// Performs one request and decodes the JSON response.
    fn exchange(&self, packet: &Packet, timeout: Duration) -> Result<Value> {
        let target = self.target(packet);
        let url = Url::parse(&format!("{}{target}", self.origin))?;
        let method = method(packet.kind);

        let mut request = self.http.request(method.clone(), url).timeout(timeout);
        if !packet.payload.is_nil() {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(serde_json::to_vec(&packet.payload)?);
        }

        let response = request.send()?;
        let status = response.status();
        let body = response.bytes()?;

        trace!(%method, target = %target, status = status.as_u16(), "HTTP exchange completed");

        let payload = decode_body(&body);
        if status.is_success() {
            return payload;
        }

        let reason = match &payload {
            Ok(value) => match map_get(value, "error") {
                Some(Value::String(s)) => s.as_str().unwrap_or_default().to_string(),
                Some(other) => other.to_string(),
                None => status.canonical_reason().unwrap_or_default().to_string(),
            },
            Err(_) => String::from_utf8_lossy(&body).into_owned(),
        };
        Err(Error::request(
            packet.operation(),
            packet.path_string(),
            status.as_u16(),
            reason,
        ))
    }

    /// Builds `/<base>/<segments>?<params>`.
    fn target(&self, packet: &Packet) -> String {
        let mut target = self.base_path.clone();
        for segment in &packet.path {
            target.push('/');
            target.push_str(&urlencoding::encode(segment));
        }
        if target.is_empty() {
            target.push('/');
        }

        let query: Vec<String> = packet
            .params
            .iter()
            .filter_map(|(key, value)| {
                param_text(value).map(|text| {
                    format!("{}={}", urlencoding::encode(key), urlencoding::encode(&text))
                })
            })
            .collect();
        if !query.is_empty() {
            target.push('?');
            target.push_str(&query.join("&"));
        }
        target
    }
}

/// Maps a packet kind to its HTTP method.
fn method(kind: Kind) -> Method {
    match kind {
        Kind::Read => Method::GET,
        Kind::Create => Method::POST,
        Kind::Update => Method::PUT,
        Kind::Delete => Method::DELETE,
    }
}

/// Converts header pairs into a [`HeaderMap`].
fn header_map(headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::config(format!("invalid header name '{name}'")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::config(format!("invalid value for header '{name}'")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Renders a param value for the query string; nil params are omitted.
fn param_text(value: &Value) -> Option<String> {
    match value {
        Value::Nil => None,
        Value::String(s) => Some(s.as_str().unwrap_or_default().to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        Value::Integer(i) => Some(i.to_string()),
        Value::F32(f) => Some(f.to_string()),
        Value::F64(f) => Some(f.to_string()),
        other => serde_json::to_string(other).ok(),
    }
}

/// Decodes a JSON body; an empty body is nil.
fn decode_body(body: &[u8]) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Nil);
    }
    Ok(serde_json::from_slice(body)?)
}

/// Maps a failed exchange to the status and reason of an `ERROR` packet.
fn error_status(error: &Error) -> (u16, String) {
    match error {
        Error::Request { status, reason, .. } => (*status, reason.clone()),
        other => (other.status().unwrap_or(STATUS_CANCELED), other.to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    use crossbeam::channel;

    use crate::identifiers::RequestId;
    use crate::protocol::Kind;

    /// Captured request: lowercased head lines and body.
    type Captured = (Vec<String>, Vec<u8>);

    /// Serves one request with the given status line and JSON body.
    fn serve_once(status: &'static str, body: &'static str) -> (Url, JoinHandle<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let url = Url::parse(&format!("http://127.0.0.1:{port}")).expect("url");

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut lines = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("read");
                let line = line.trim_end().to_ascii_lowercase();
                if line.is_empty() {
                    break;
                }
                lines.push(line);
            }
            let length = lines
                .iter()
                .find_map(|l| l.strip_prefix("content-length: "))
                .map_or(0, |n| n.parse::<usize>().expect("length"));
            let mut request_body = vec![0u8; length];
            reader.read_exact(&mut request_body).expect("body");

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            (&stream).write_all(response.as_bytes()).expect("write");
            (lines, request_body)
        });
        (url, handle)
    }

    fn backend(url: &Url) -> (RestBackend, channel::Receiver<BackendEvent>) {
        let (tx, rx) = channel::unbounded();
        let sink: EventSink = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        let options = ConnectOptions {
            connect_timeout: Duration::from_secs(5),
            max_message_size: 1 << 20,
            ping_interval: Duration::from_secs(20),
        };
        let session = Session::with_keys("key", "secret", Some(7), None);
        let backend = RestBackend::new(url, &session, &options, sink).expect("backend");
        (backend, rx)
    }

    #[test]
    fn test_call_success() {
        let (url, server) = serve_once("200 OK", r#"{"id":1,"name":"lobby"}"#);
        let (backend, _events) = backend(&url);

        let mut params = crate::protocol::Params::new();
        params.insert("limit".to_string(), Value::from(5));
        params.insert("q".to_string(), Value::from("a b"));
        let packet = Packet::new(Kind::Create, ["rooms", "1"])
            .with_id(RequestId::FIRST)
            .with_params(params)
            .with_payload(Value::Map(vec![(Value::from("name"), Value::from("lobby"))]));

        let value = backend.call(&packet, Duration::from_secs(5)).expect("call");
        assert_eq!(map_get(&value, "id").and_then(Value::as_u64), Some(1));

        let (lines, body) = server.join().expect("server");
        assert_eq!(lines[0], "post /rooms/1?limit=5&q=a%20b http/1.1");
        assert!(lines.iter().any(|l| l == "content-type: application/json"));
        assert!(lines.iter().any(|l| l == "frankly-app-user-id: 7"));
        assert!(lines.iter().any(|l| l == "frankly-app-key: key"));
        assert!(lines.iter().any(|l| l.starts_with("user-agent: frankly-sdk/")));
        assert_eq!(body, br#"{"name":"lobby"}"#);
    }

    #[test]
    fn test_call_error_status() {
        let (url, server) = serve_once("404 Not Found", r#"{"status":404,"error":"no such room"}"#);
        let (backend, _events) = backend(&url);

        let packet = Packet::new(Kind::Read, ["rooms", "9"]).with_id(RequestId::FIRST);
        let err = backend.call(&packet, Duration::from_secs(5)).unwrap_err();
        match err {
            Error::Request {
                operation,
                path,
                status,
                reason,
            } => {
                assert_eq!(operation, "read");
                assert_eq!(path, "/rooms/9");
                assert_eq!(status, 404);
                assert_eq!(reason, "no such room");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let (lines, body) = server.join().expect("server");
        assert_eq!(lines[0], "get /rooms/9 http/1.1");
        assert!(body.is_empty());
    }

    #[test]
    fn test_send_reports_ok_packet() {
        let (url, server) = serve_once("200 OK", "[1,2]");
        let (backend, events) = backend(&url);

        let packet = Packet::new(Kind::Read, ["rooms"])
            .with_id(RequestId::new(3))
            .with_seed(11);
        backend.send(&packet, Duration::from_secs(5)).expect("send");

        let event = events.recv_timeout(Duration::from_secs(5)).expect("event");
        let BackendEvent::Packet(response) = event else {
            panic!("unexpected event {event:?}");
        };
        assert_eq!(response.kind, Kind::OK);
        assert_eq!(response.id, RequestId::new(3));
        assert_eq!(response.seed, 11);
        assert_eq!(response.path, vec!["rooms".to_string()]);
        assert_eq!(response.payload, Value::Array(vec![Value::from(1), Value::from(2)]));
        server.join().expect("server");
    }

    #[test]
    fn test_send_reports_error_packet() {
        let (url, server) = serve_once("401 Unauthorized", r#"{"error":"expired"}"#);
        let (backend, events) = backend(&url);

        let packet = Packet::new(Kind::Delete, ["rooms", "1"]).with_id(RequestId::new(4));
        backend.send(&packet, Duration::from_secs(5)).expect("send");

        let event = events.recv_timeout(Duration::from_secs(5)).expect("event");
        let BackendEvent::Packet(response) = event else {
            panic!("unexpected event {event:?}");
        };
        assert_eq!(response.kind, Kind::ERROR);
        assert_eq!(response.error_status(), (401, "expired".to_string()));
        server.join().expect("server");
    }

    #[test]
    fn test_closed_backend_rejects_requests() {
        let url = Url::parse("http://127.0.0.1:9").expect("url");
        let (backend, events) = backend(&url);
        backend.close(1000, "done");
        assert!(!backend.is_open());

        let packet = Packet::new(Kind::Read, ["rooms"]).with_id(RequestId::FIRST);
        assert!(matches!(
            backend.call(&packet, Duration::from_secs(1)),
            Err(Error::ConnectionClosed)
        ));
        assert!(matches!(
            backend.send(&packet, Duration::from_secs(1)),
            Err(Error::ConnectionClosed)
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_param_text_and_body_decoding() {
        assert_eq!(param_text(&Value::Nil), None);
        assert_eq!(param_text(&Value::from(true)).as_deref(), Some("true"));
        assert_eq!(param_text(&Value::from(-3)).as_deref(), Some("-3"));
        assert_eq!(param_text(&Value::from("x")).as_deref(), Some("x"));

        assert_eq!(decode_body(b"").expect("empty"), Value::Nil);
        assert_eq!(decode_body(b" \n").expect("blank"), Value::Nil);
        assert!(decode_body(b"not json").is_err());
    }

    #[test]
    fn test_methods_and_header_map() {
        assert_eq!(method(Kind::Read), Method::GET);
        assert_eq!(method(Kind::Create), Method::POST);
        assert_eq!(method(Kind::Update), Method::PUT);
        assert_eq!(method(Kind::Delete), Method::DELETE);

        let map = header_map(&[("Frankly-App-Key".to_string(), "k".to_string())]).expect("map");
        assert_eq!(map.get("frankly-app-key").and_then(|v| v.to_str().ok()), Some("k"));
        let err = header_map(&[("Bad".to_string(), "line\nbreak".to_string())]).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_unreachable_server_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = Url::parse(&format!("http://{}", listener.local_addr().expect("addr"))).expect("url");
        drop(listener);

        let (backend, _events) = backend(&url);
        let packet = Packet::new(Kind::Read, ["rooms"]).with_id(RequestId::FIRST);
        let err = backend.call(&packet, Duration::from_secs(2)).unwrap_err();
        assert!(err.is_connection_error(), "{err:?}");
    }
}
