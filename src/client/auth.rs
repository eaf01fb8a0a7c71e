//! Sessions and authenticators.
//!
//! Every connection attempt starts by asking an [`Authenticator`] for a
//! fresh [`Session`]. Two strategies are provided:
//!
//! | Authenticator | Session | Network |
//! |---------------|---------|---------|
//! | [`KeyAuthenticator`] | App key and secret sent as headers | None |
//! | [`TokenAuthenticator`] | `app-token` cookie | Nonce and identity-token exchange |
//!
//! The identity token is an HS256 JWT signed with the app secret; see
//! [`generate_identity_token`].

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{ACCEPT, SET_COOKIE};
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::transport::{SESSION_COOKIE, USER_AGENT};

// ============================================================================
// Constants
// ============================================================================

/// Identity token lifetime in seconds (ten days).
pub const IDENTITY_TOKEN_LIFETIME: u64 = 864_000;

/// JWT `cty` header of identity tokens.
const IDENTITY_TOKEN_CONTENT_TYPE: &str = "frankly-it;v1";

/// Header carrying the identity token.
const IDENTITY_TOKEN_HEADER: &str = "Frankly-App-Identity-Token";

// ============================================================================
// Session
// ============================================================================

/// How a session identifies itself to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// App key and secret, optionally acting for a user.
    Keys {
        /// App key.
        app_key: String,
        /// App secret.
        app_secret: String,
        /// User the client acts for.
        user: Option<u64>,
        /// Role requested for the user, such as `admin`.
        role: Option<String>,
    },
    /// Cookies returned by the authentication exchange.
    Cookies(BTreeMap<String, String>),
}

/// Result of one authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Credentials sent with every connection.
    pub credentials: Credentials,
    /// Replay seed; resends carrying it are deduplicated by the service.
    pub seed: u64,
    /// Session metadata returned by the service.
    pub info: serde_json::Value,
}

impl Session {
    /// Creates a pre-resolved key/secret session with seed 0.
    #[must_use]
    pub fn with_keys(
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        user: Option<u64>,
        role: Option<String>,
    ) -> Self {
        Self {
            credentials: Credentials::Keys {
                app_key: app_key.into(),
                app_secret: app_secret.into(),
                user,
                role,
            },
            seed: 0,
            info: serde_json::json!({ "seed": 0 }),
        }
    }

    /// Creates a cookie session.
    #[must_use]
    pub fn with_cookies(cookies: BTreeMap<String, String>, seed: u64, info: serde_json::Value) -> Self {
        Self {
            credentials: Credentials::Cookies(cookies),
            seed,
            info,
        }
    }

    /// Returns the user id from the key credentials or the session info.
    #[must_use]
    pub fn user_id(&self) -> Option<u64> {
        match &self.credentials {
            Credentials::Keys { user, .. } => *user,
            Credentials::Cookies(_) => self.info.pointer("/user/id").and_then(serde_json::Value::as_u64),
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.credentials {
            Credentials::Keys { app_key, user, role, .. } => write!(
                f,
                "session {{ key = {app_key}, user = {}, role = {} }}",
                user.map_or_else(|| "none".to_string(), |u| u.to_string()),
                role.as_deref().unwrap_or("none"),
            ),
            Credentials::Cookies(cookies) => {
                let names: Vec<&str> = cookies.keys().map(String::as_str).collect();
                write!(
                    f,
                    "session {{ app = {}, user = {}, cookies = [{}] }}",
                    self.info.pointer("/app/id").unwrap_or(&serde_json::Value::Null),
                    self.info.pointer("/user/id").unwrap_or(&serde_json::Value::Null),
                    names.join(", "),
                )
            }
        }
    }
}

// ============================================================================
// Authenticator
// ============================================================================

/// Produces a fresh [`Session`] for every connection attempt.
pub trait Authenticator: Send + Sync {
    /// Authenticates and returns a session.
    ///
    /// # Errors
    ///
    /// Returns the transport or request error that prevented authentication.
    fn authenticate(&self) -> Result<Session>;

    /// Returns `true` if [`authenticate`](Self::authenticate) never blocks on
    /// the network.
    fn is_preresolved(&self) -> bool {
        false
    }
}

/// Authenticator returning a fixed key/secret session.
#[derive(Debug, Clone)]
pub struct KeyAuthenticator {
    session: Session,
}

impl KeyAuthenticator {
    /// Creates an authenticator for the given app credentials.
    #[must_use]
    pub fn new(
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        user: Option<u64>,
        role: Option<String>,
    ) -> Self {
        Self {
            session: Session::with_keys(app_key, app_secret, user, role),
        }
    }
}

impl Authenticator for KeyAuthenticator {
    fn authenticate(&self) -> Result<Session> {
        Ok(self.session.clone())
    }

    fn is_preresolved(&self) -> bool {
        true
    }
}

/// Callback turning a nonce into a signed identity token.
pub type IdentityTokenGenerator = Arc<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// Authenticator performing the nonce and identity-token exchange.
///
/// 1. `GET /auth/nonce` returns a nonce.
/// 2. The generator signs an identity token for it.
/// 3. `GET /auth` with `Frankly-App-Identity-Token` returns session cookies
///    and the session info.
pub struct TokenAuthenticator {
    address: Url,
    generator: IdentityTokenGenerator,
    http: HttpClient,
}

impl TokenAuthenticator {
    /// Creates an authenticator for the service at `url`.
    ///
    /// WebSocket addresses are mapped to their HTTP equivalent and any path
    /// or query is dropped.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for an unsupported scheme or a URL without a host
    /// - [`Error::Http`] if the HTTP client cannot be built
    pub fn new(url: &Url, generator: IdentityTokenGenerator, timeout: Duration) -> Result<Self> {
        let scheme = match url.scheme() {
            "ws" | "http" => "http",
            "wss" | "https" => "https",
            other => return Err(Error::config(format!("unsupported scheme '{other}'"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::config(format!("URL '{url}' has no host")))?;
        let address = match url.port() {
            Some(port) => format!("{scheme}://{host}:{port}"),
            None => format!("{scheme}://{host}"),
        };

        // Authentication runs once per connection attempt; idle sockets are
        // not kept between attempts.
        let http = HttpClient::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(0)
            .no_proxy()
            .build()?;

        Ok(Self {
            address: Url::parse(&address)?,
            generator,
            http,
        })
    }

    fn get(&self, path: &str, token: Option<&str>) -> Result<Response> {
        let mut request = self
            .http
            .get(self.address.join(path)?)
            .header(ACCEPT, "application/json");
        if let Some(token) = token {
            request = request.header(IDENTITY_TOKEN_HEADER, token);
        }

        let response = request.send()?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.bytes()?;
            return Err(auth_error(path, status, &body));
        }
        Ok(response)
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self) -> Result<Session> {
        let body = self.get("/auth/nonce", None)?.bytes()?;
        let nonce = match serde_json::from_slice::<serde_json::Value>(&body)? {
            serde_json::Value::String(nonce) => nonce,
            other => other.to_string(),
        };

        let token = (self.generator)(&nonce)?;
        let response = self.get("/auth", Some(&token))?;

        let cookies: BTreeMap<String, String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|cookie| {
                let pair = cookie.split(';').next()?;
                let (name, value) = pair.split_once('=')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();
        if !cookies.contains_key(SESSION_COOKIE) {
            return Err(Error::request("auth", "/auth", 500, "no session cookie in response"));
        }

        let info: serde_json::Value = serde_json::from_slice(&response.bytes()?)?;
        let seed = info.get("seed").and_then(serde_json::Value::as_u64).unwrap_or(0);

        let session = Session::with_cookies(cookies, seed, info);
        debug!(%session, "Authenticated");
        Ok(session)
    }
}

fn auth_error(path: &str, status: StatusCode, body: &[u8]) -> Error {
    let reason = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(serde_json::Value::as_str).map(str::to_string))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or_default().to_string());
    Error::request("auth", path, status.as_u16(), reason)
}

// ============================================================================
// Identity Tokens
// ============================================================================

#[derive(Serialize)]
struct IdentityClaims<'a> {
    aak: &'a str,
    iat: u64,
    exp: u64,
    nce: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    uid: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
}

/// Signs an identity token for one authentication attempt.
///
/// # Errors
///
/// Returns [`Error::Token`] if signing fails.
pub fn generate_identity_token(
    app_key: &str,
    app_secret: &str,
    nonce: &str,
    uid: Option<u64>,
    role: Option<&str>,
) -> Result<String> {
    let iat = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let claims = IdentityClaims {
        aak: app_key,
        iat,
        exp: iat + IDENTITY_TOKEN_LIFETIME,
        nce: nonce,
        uid,
        role,
    };

    let mut header = Header::new(Algorithm::HS256);
    header.typ = Some("JWS".to_string());
    header.cty = Some(IDENTITY_TOKEN_CONTENT_TYPE.to_string());

    Ok(jsonwebtoken::encode(
        &header,
        &claims,
        &EncodingKey::from_secret(app_secret.as_bytes()),
    )?)
}

/// Returns a generator signing identity tokens with fixed credentials.
#[must_use]
pub fn identity_token_generator(
    app_key: impl Into<String>,
    app_secret: impl Into<String>,
    uid: Option<u64>,
    role: Option<String>,
) -> IdentityTokenGenerator {
    let app_key = app_key.into();
    let app_secret = app_secret.into();
    Arc::new(move |nonce: &str| {
        generate_identity_token(&app_key, &app_secret, nonce, uid, role.as_deref())
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    use jsonwebtoken::{DecodingKey, Validation};

    #[test]
    fn test_key_authenticator() {
        let auth = KeyAuthenticator::new("key", "secret", Some(3), None);
        assert!(auth.is_preresolved());

        let session = auth.authenticate().expect("session");
        assert_eq!(session.seed, 0);
        assert_eq!(session.user_id(), Some(3));
        assert_eq!(session.to_string(), "session { key = key, user = 3, role = none }");
    }

    #[test]
    fn test_identity_token_claims() {
        let token =
            generate_identity_token("app-key", "app-secret", "nonce-1", Some(42), Some("admin"))
                .expect("token");

        let header = jsonwebtoken::decode_header(&token).expect("header");
        assert_eq!(header.alg, Algorithm::HS256);
        assert_eq!(header.typ.as_deref(), Some("JWS"));
        assert_eq!(header.cty.as_deref(), Some("frankly-it;v1"));

        let data = jsonwebtoken::decode::<serde_json::Value>(
            &token,
            &DecodingKey::from_secret(b"app-secret"),
            &Validation::new(Algorithm::HS256),
        )
        .expect("decode");
        let claims = data.claims;
        assert_eq!(claims["aak"], "app-key");
        assert_eq!(claims["nce"], "nonce-1");
        assert_eq!(claims["uid"], 42);
        assert_eq!(claims["role"], "admin");
        let iat = claims["iat"].as_u64().expect("iat");
        assert_eq!(claims["exp"].as_u64(), Some(iat + IDENTITY_TOKEN_LIFETIME));
    }

    #[test]
    fn test_identity_token_omits_unset_claims() {
        let generate = identity_token_generator("k", "s", None, None);
        let token = generate("n").expect("token");

        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        let claims = jsonwebtoken::decode::<serde_json::Value>(
            &token,
            &DecodingKey::from_secret(b"s"),
            &validation,
        )
        .expect("decode")
        .claims;
        assert!(claims.get("uid").is_none());
        assert!(claims.get("role").is_none());
    }

    #[test]
    fn test_token_authenticator_address_mapping() {
        let generate = identity_token_generator("k", "s", None, None);
        let url = Url::parse("wss://api.example.com/socket?x=1").expect("url");
        let auth = TokenAuthenticator::new(&url, Arc::clone(&generate), Duration::from_secs(1))
            .expect("auth");
        assert_eq!(auth.address.as_str(), "https://api.example.com/");
        assert!(!auth.is_preresolved());

        let url = Url::parse("ws://127.0.0.1:8080").expect("url");
        let auth = TokenAuthenticator::new(&url, generate, Duration::from_secs(1)).expect("auth");
        assert_eq!(auth.address.as_str(), "http://127.0.0.1:8080/");
    }

    #[test]
    fn test_token_authenticator_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let server = thread::spawn(move || {
            let mut requests = Vec::new();
            let replies = [
                "HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\n\"n-123\"".to_string(),
                {
                    let body = r#"{"seed":77,"app":{"id":1},"user":{"id":5}}"#;
                    format!(
                        "HTTP/1.1 200 OK\r\nSet-Cookie: app-token=abc; Path=/; HttpOnly\r\nSet-Cookie: other=1\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    )
                },
            ];
            for reply in replies {
                let (stream, _) = listener.accept().expect("accept");
                let mut reader = BufReader::new(stream.try_clone().expect("clone"));
                let mut lines = Vec::new();
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).expect("read");
                    let line = line.trim_end().to_string();
                    if line.is_empty() {
                        break;
                    }
                    lines.push(line);
                }
                (&stream).write_all(reply.as_bytes()).expect("write");
                (&stream).flush().expect("flush");
                requests.push(lines);
            }
            requests
        });

        let url = Url::parse(&format!("ws://127.0.0.1:{port}")).expect("url");
        let generate = identity_token_generator("k", "s", Some(5), None);
        let auth = TokenAuthenticator::new(&url, generate, Duration::from_secs(5)).expect("auth");
        let session = auth.authenticate().expect("session");

        assert_eq!(session.seed, 77);
        assert_eq!(session.user_id(), Some(5));
        match &session.credentials {
            Credentials::Cookies(cookies) => {
                assert_eq!(cookies.get("app-token").map(String::as_str), Some("abc"));
                assert_eq!(cookies.get("other").map(String::as_str), Some("1"));
            }
            other => panic!("unexpected credentials {other:?}"),
        }

        let requests = server.join().expect("server");
        assert_eq!(requests[0][0], "GET /auth/nonce HTTP/1.1");
        assert_eq!(requests[1][0], "GET /auth HTTP/1.1");
        let header = |lines: &[String], name: &str| {
            lines.iter().find_map(|l| {
                let (key, value) = l.split_once(": ")?;
                key.eq_ignore_ascii_case(name).then(|| value.to_string())
            })
        };
        assert_eq!(header(&requests[0], "accept").as_deref(), Some("application/json"));
        assert_eq!(header(&requests[0], "user-agent").as_deref(), Some(USER_AGENT));
        assert!(header(&requests[0], IDENTITY_TOKEN_HEADER).is_none());
        let token = header(&requests[1], IDENTITY_TOKEN_HEADER).expect("token header");
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        let claims = jsonwebtoken::decode::<serde_json::Value>(
            &token,
            &DecodingKey::from_secret(b"s"),
            &validation,
        )
        .expect("decode")
        .claims;
        assert_eq!(claims["nce"], "n-123");
    }

    #[test]
    fn test_token_authenticator_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut line = String::new();
            while reader.read_line(&mut line).expect("read") > 2 {
                line.clear();
            }
            let body = r#"{"error":"bad app"}"#;
            let reply = format!(
                "HTTP/1.1 403 Forbidden\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            (&stream).write_all(reply.as_bytes()).expect("write");
        });

        let url = Url::parse(&format!("http://127.0.0.1:{port}")).expect("url");
        let auth = TokenAuthenticator::new(
            &url,
            identity_token_generator("k", "s", None, None),
            Duration::from_secs(5),
        )
        .expect("auth");
        let err = auth.authenticate().unwrap_err();
        server.join().expect("server");

        assert_eq!(err.status(), Some(403));
        assert_eq!(err.to_string(), "[403] bad app (auth /auth/nonce)");
    }
}
